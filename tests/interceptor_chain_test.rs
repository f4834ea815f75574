//! 拦截器链集成测试
//!
//! 通过 `CompositeInterceptor` 构建完整的客户端/服务端调用链，
//! 使用内存日志输出端、独立的 prometheus registry 与内存 span exporter 观察副作用。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use flare_rpc_interceptor::interceptor::Handler;
use flare_rpc_interceptor::logging::{FieldValue, MemorySink, Severity};
use flare_rpc_interceptor::transport::{
    apply_response_headers, client_request, response_cpu_usage, server_context,
};
use flare_rpc_interceptor::{
    CallContext, CallType, CompositeInterceptor, CpuSampler, HeaderRegistry, InterceptorConfig,
    Metadata, MetricsCollector, PropagatedHeaders, handler_fn,
};
use futures::FutureExt;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Response, Status};

struct FixedCpu(Option<u64>);

impl CpuSampler for FixedCpu {
    fn usage(&self) -> Option<u64> {
        self.0
    }
}

/// 测试环境：每个测试独立的日志、指标与 header 注册表
struct Harness {
    sink: MemorySink,
    metrics: MetricsCollector,
    registry: Arc<HeaderRegistry>,
    provider: SdkTracerProvider,
    exporter: InMemorySpanExporter,
}

impl Harness {
    fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let registry = Arc::new(HeaderRegistry::new());
        registry.replace(PropagatedHeaders::new(["x-tenant-id"]));
        Self {
            sink: MemorySink::new(),
            metrics: MetricsCollector::new(&Registry::new()).unwrap(),
            registry,
            provider,
            exporter,
        }
    }

    fn composite(&self, config: InterceptorConfig, cpu: Option<u64>) -> CompositeInterceptor {
        CompositeInterceptor::new(config)
            .with_sink(self.sink.clone())
            .with_metrics(self.metrics.clone())
            .with_registry(self.registry.clone())
            .with_cpu_sampler(FixedCpu(cpu))
            .with_tracer(BoxedTracer::new(Box::new(self.provider.tracer("test"))))
    }
}

fn server_ctx(incoming: Metadata) -> CallContext {
    CallContext::server(
        CallType::Unary,
        "/greeter.Greeter/SayHello",
        incoming,
        Some("10.1.2.3:40000".parse().unwrap()),
    )
}

#[tokio::test]
async fn test_server_success_logs_once_with_trace_id() {
    let harness = Harness::new();
    let chain = harness
        .composite(InterceptorConfig::default().with_access_log(true), None)
        .server_unary::<String, String>();
    let handler = handler_fn(|_ctx: CallContext, req: String| async move { Ok(format!("hello {req}")) });

    let reply = assert_ok!(
        chain
            .call(server_ctx(Metadata::new().with("app", "web")), "bob".into(), &handler)
            .await
    );
    assert_eq!(reply, "hello bob");

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Info);
    assert_eq!(records[0].event(), Some("normal"));
    assert_eq!(records[0].fields.get_str("peer_name"), Some("web"));

    let spans = harness.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let tid = spans[0].span_context.trace_id().to_string();
    assert_eq!(records[0].fields.get_str("tid"), Some(tid.as_str()));

    let count = harness
        .metrics
        .server_handle_total
        .with_label_values(&["unary", "/greeter.Greeter/SayHello", "web", "OK"])
        .get();
    assert_eq!(count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_call_emits_single_warning() {
    let harness = Harness::new();
    let config = InterceptorConfig::default()
        .with_access_log(true)
        .with_slow_log_threshold(Duration::from_millis(100));
    let chain = harness.composite(config, None).server_unary::<String, String>();
    let handler = handler_fn(|_ctx: CallContext, req: String| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(req)
    });

    assert_ok!(chain.call(server_ctx(Metadata::new()), String::new(), &handler).await);

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Warn);
    assert_eq!(records[0].message, "slow");
    assert_eq!(records[0].event(), Some("slow"));
}

#[tokio::test(start_paused = true)]
async fn test_fast_call_without_access_log_emits_nothing() {
    let harness = Harness::new();
    let config = InterceptorConfig::default().with_slow_log_threshold(Duration::from_millis(100));
    let chain = harness.composite(config, None).server_unary::<String, String>();
    let handler = handler_fn(|_ctx: CallContext, req: String| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(req)
    });

    assert_ok!(chain.call(server_ctx(Metadata::new()), String::new(), &handler).await);
    assert!(harness.sink.is_empty());
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let harness = Harness::new();
    let chain = harness
        .composite(InterceptorConfig::default(), None)
        .server_unary::<u32, u32>();
    let handler = handler_fn(|_ctx: CallContext, req: u32| async move {
        if req == 0 {
            panic!("unexpected zero");
        }
        Ok(100 / req)
    });

    let err = assert_err!(chain.call(server_ctx(Metadata::new()), 0, &handler).await);
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "unexpected zero");

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Error);
    assert_eq!(records[0].event(), Some("recover"));
    assert_eq!(records[0].fields.get("code"), Some(&FieldValue::Int(500)));
    let stack = records[0].fields.get_str("stack").unwrap();
    assert!(!stack.is_empty() && stack.len() <= 4096);

    // 之后的调用不受影响
    assert_eq!(assert_ok!(chain.call(server_ctx(Metadata::new()), 4, &handler).await), 25);
}

#[tokio::test]
async fn test_business_error_returned_unchanged() {
    let harness = Harness::new();
    let chain = harness
        .composite(InterceptorConfig::default(), None)
        .server_unary::<u32, u32>();
    let handler = handler_fn(|_ctx: CallContext, _req: u32| async move {
        Err::<u32, _>(Status::not_found("user 7 not found"))
    });

    let err = assert_err!(chain.call(server_ctx(Metadata::new()), 7, &handler).await);
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), "user 7 not found");

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Warn);
    assert_eq!(records[0].event(), Some("error"));
}

#[tokio::test(start_paused = true)]
async fn test_client_default_deadline() {
    let harness = Harness::new();
    let config = InterceptorConfig::default().with_read_timeout(Duration::from_millis(3000));
    let chain = harness.composite(config, None).client_unary::<(), ()>();
    let start = Instant::now();

    let handler = handler_fn(move |ctx: CallContext, _req: ()| async move {
        assert_eq!(ctx.deadline(), Some(start + Duration::from_millis(3000)));
        Ok(())
    });
    let ctx = CallContext::client(CallType::Unary, "/greeter.Greeter/SayHello", "greeter:9000");
    assert_ok!(chain.call(ctx, (), &handler).await);

    let caller_deadline = start + Duration::from_millis(800);
    let handler = handler_fn(move |ctx: CallContext, _req: ()| async move {
        assert_eq!(ctx.deadline(), Some(caller_deadline));
        Ok(())
    });
    let ctx = CallContext::client(CallType::Unary, "/greeter.Greeter/SayHello", "greeter:9000")
        .with_deadline(caller_deadline);
    assert_ok!(chain.call(ctx, (), &handler).await);
}

#[tokio::test(start_paused = true)]
async fn test_client_times_out_and_logs_error() {
    let harness = Harness::new();
    let config = InterceptorConfig::default()
        .with_read_timeout(Duration::from_millis(200))
        .with_slow_log_threshold(Duration::from_millis(100));
    let chain = harness.composite(config, None).client_unary::<(), ()>();
    let handler = handler_fn(|_ctx: CallContext, _req: ()| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    });

    let ctx = CallContext::client(CallType::Unary, "/greeter.Greeter/SayHello", "greeter:9000");
    let err = assert_err!(chain.call(ctx, (), &handler).await);
    assert_eq!(err.code(), Code::DeadlineExceeded);

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].severity, Severity::Error);
    assert_eq!(records[0].fields.get("code"), Some(&FieldValue::Int(504)));
    assert_eq!(records[0].fields.get("slow"), Some(&FieldValue::Bool(true)));
    assert_eq!(records[0].fields.get_str("name"), Some("greeter:9000"));

    // 超时结果同样经过指标与追踪
    let spans = harness.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    let count = harness
        .metrics
        .client_handle_total
        .with_label_values(&["unary", "", "/greeter.Greeter/SayHello", "greeter:9000", "Gateway Timeout"])
        .get();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_client_cancelled_call_is_logged() {
    let harness = Harness::new();
    let chain = harness
        .composite(InterceptorConfig::default(), None)
        .client_unary::<(), ()>();
    let parent = CancellationToken::new();
    let handler = handler_fn({
        let parent = parent.clone();
        move |_ctx: CallContext, _req: ()| {
            let parent = parent.clone();
            async move {
                parent.cancel();
                std::future::pending::<Result<(), Status>>().await
            }
        }
    });

    let ctx = CallContext::client(CallType::Unary, "/greeter.Greeter/SayHello", "greeter:9000")
        .with_cancellation(parent.clone());
    let err = assert_err!(chain.call(ctx, (), &handler).await);
    assert_eq!(err.code(), Code::Cancelled);

    let records = harness.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event(), Some("error"));
}

#[tokio::test]
async fn test_client_panic_finishes_span_and_releases_token() {
    let harness = Harness::new();
    let chain = harness
        .composite(InterceptorConfig::default(), None)
        .client_unary::<u32, u32>();
    let seen = Arc::new(Mutex::new(None::<CancellationToken>));
    let handler = handler_fn({
        let seen = seen.clone();
        move |ctx: CallContext, req: u32| {
            *seen.lock() = Some(ctx.cancellation().clone());
            async move {
                if req == 0 {
                    panic!("invoker exploded");
                }
                Ok(req)
            }
        }
    });

    let ctx = CallContext::client(CallType::Unary, "/greeter.Greeter/SayHello", "greeter:9000");
    let parent = ctx.cancellation().clone();
    let outcome = AssertUnwindSafe(chain.call(ctx, 0, &handler))
        .catch_unwind()
        .await;
    assert!(outcome.is_err());

    let spans = harness.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "/greeter.Greeter/SayHello");

    let token = seen.lock().take().unwrap();
    assert!(token.is_cancelled());
    assert!(!parent.is_cancelled());
}

/// 客户端发出的 `tonic::Request` 经服务端链处理，CPU 使用率通过响应 header 回到客户端
async fn cpu_round_trip(server_cpu: Option<u64>) -> Option<u64> {
    let harness = Harness::new();
    let client_chain = harness
        .composite(
            InterceptorConfig::default().with_app_name("web").with_cpu_usage(true),
            None,
        )
        .client_unary::<String, String>();
    let server_chain = harness
        .composite(InterceptorConfig::default().with_app_name("greeter"), server_cpu)
        .server_unary::<String, String>();

    let invoker = handler_fn(move |ctx: CallContext, req: String| {
        let server_chain = server_chain.clone();
        async move {
            let request = client_request(&ctx, req);
            let server = server_context(CallType::Unary, ctx.method(), &request);
            assert_eq!(server.peer_app(), "web");

            let handler = handler_fn(|_ctx: CallContext, req: String| async move { Ok(req) });
            let reply = server_chain.call(server.clone(), request.into_inner(), &handler).await?;
            let mut response = Response::new(reply);
            apply_response_headers(&server, &mut response);
            Ok::<_, Status>(response_cpu_usage(&response).map(|usage| usage.to_string()).unwrap_or_default())
        }
    });

    let ctx = CallContext::client(CallType::Unary, "/greeter.Greeter/SayHello", "greeter:9000");
    let usage = client_chain.call(ctx, "ping".into(), &invoker).await.unwrap();
    usage.parse().ok()
}

#[tokio::test]
async fn test_cpu_usage_exchange() {
    assert_eq!(cpu_round_trip(Some(375)).await, Some(375));
    assert_eq!(cpu_round_trip(Some(0)).await, None);
    assert_eq!(cpu_round_trip(None).await, None);
}

#[tokio::test]
async fn test_headers_and_trace_propagate_through_nested_call() {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let harness = Harness::new();
    let server_chain = harness
        .composite(InterceptorConfig::default().with_app_name("gateway"), None)
        .server_unary::<String, String>();
    let client_chain = harness
        .composite(InterceptorConfig::default().with_app_name("gateway"), None)
        .client_unary::<String, String>();

    // 下游 invoker 把 outgoing metadata 原样返回
    let invoker = handler_fn(|ctx: CallContext, _req: String| async move {
        let outgoing = ctx.outgoing();
        Ok(format!(
            "{}|{}|{}",
            outgoing.get("x-tenant-id").unwrap_or_default(),
            outgoing.get("app").unwrap_or_default(),
            outgoing.contains_key("traceparent"),
        ))
    });
    let handler = handler_fn(move |ctx: CallContext, req: String| {
        let client_chain = client_chain.clone();
        let invoker = invoker.clone();
        async move {
            assert_eq!(ctx.value("x-tenant-id"), Some("t-42"));
            let outbound = ctx.outbound(CallType::Unary, "/user.User/Get", "user:9000");
            client_chain.call(outbound, req, &invoker).await
        }
    });

    let incoming = Metadata::new().with("x-tenant-id", "t-42").with("app", "web");
    let reply = assert_ok!(server_chain.call(server_ctx(incoming), "q".into(), &handler).await);
    assert_eq!(reply, "t-42|gateway|true");

    // 客户端 span 是服务端 span 的子 span
    let spans = harness.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    let client = spans.iter().find(|s| s.name == "/user.User/Get").unwrap();
    let server = spans.iter().find(|s| s.name == "/greeter.Greeter/SayHello").unwrap();
    assert_eq!(client.span_context.trace_id(), server.span_context.trace_id());
    assert_eq!(client.parent_span_id, server.span_context.span_id());
}

#[tokio::test]
async fn test_server_extracts_remote_parent() {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let harness = Harness::new();
    let chain = harness
        .composite(InterceptorConfig::default(), None)
        .server_unary::<(), ()>();
    let incoming = Metadata::new().with(
        "traceparent",
        "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
    );
    let handler = handler_fn(|_ctx: CallContext, _req: ()| async move { Ok(()) });

    assert_ok!(chain.call(server_ctx(incoming), (), &handler).await);

    let spans = harness.exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(
        spans[0].span_context.trace_id().to_string(),
        "4bf92f3577b34da6a3ce929d0e0e4736"
    );
    assert_eq!(spans[0].parent_span_id.to_string(), "00f067aa0ba902b7");
}

#[tokio::test]
async fn test_bound_chain_serves_concurrent_calls() {
    let harness = Harness::new();
    let bound = Arc::new(
        harness
            .composite(InterceptorConfig::default().with_access_log(true), None)
            .server_unary::<u32, u32>()
            .bind(handler_fn(|_ctx: CallContext, req: u32| async move { Ok(req * 2) })),
    );

    let mut tasks = Vec::new();
    for i in 0..16u32 {
        let bound = bound.clone();
        tasks.push(tokio::spawn(async move {
            bound.call(server_ctx(Metadata::new()), i).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), i as u32 * 2);
    }
    assert_eq!(harness.sink.len(), 16);
}
