//! 归一化状态码
//!
//! 传输层的 gRPC 状态码不直接用于日志级别判断，而是先映射到 HTTP 语义的状态码：
//! - 2xx: 成功
//! - 4xx: 调用方错误（业务错误，warn）
//! - 5xx: 服务端错误（error）

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use tonic::{Code, Status};

/// 将 gRPC 状态码映射为归一化的 HTTP 状态码
pub fn normalize(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        // 499 Client Closed Request 没有标准常量
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

/// 调用结果分类（用于日志级别）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeClass {
    Success,
    ClientFault,
    ServerFault,
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeClass::Success => write!(f, "SUCCESS"),
            OutcomeClass::ClientFault => write!(f, "CLIENT_FAULT"),
            OutcomeClass::ServerFault => write!(f, "SERVER_FAULT"),
        }
    }
}

impl OutcomeClass {
    /// 由归一化状态码得到分类
    pub fn from_status_code(code: StatusCode) -> Self {
        if code.is_server_error() {
            OutcomeClass::ServerFault
        } else if code.is_client_error() {
            OutcomeClass::ClientFault
        } else {
            OutcomeClass::Success
        }
    }
}

/// 调用结果的分类
pub fn outcome_class(err: Option<&Status>) -> OutcomeClass {
    match err {
        None => OutcomeClass::Success,
        Some(status) => match OutcomeClass::from_status_code(normalize(status.code())) {
            // 携带 Code::Ok 的错误按服务端错误处理
            OutcomeClass::Success => OutcomeClass::ServerFault,
            class => class,
        },
    }
}

/// 指标中的结果标签，使用归一化状态码的标准短语
pub fn outcome_label(err: Option<&Status>) -> &'static str {
    let code = err.map(Status::code).unwrap_or(Code::Ok);
    normalize(code).canonical_reason().unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_server_faults() {
        assert_eq!(normalize(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(normalize(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(normalize(Code::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(normalize(Code::Cancelled).as_u16(), 499);
    }

    #[test]
    fn test_outcome_class() {
        assert_eq!(outcome_class(None), OutcomeClass::Success);
        assert_eq!(
            outcome_class(Some(&Status::not_found("missing"))),
            OutcomeClass::ClientFault
        );
        assert_eq!(
            outcome_class(Some(&Status::internal("boom"))),
            OutcomeClass::ServerFault
        );
        assert_eq!(
            outcome_class(Some(&Status::unknown("opaque"))),
            OutcomeClass::ServerFault
        );
    }

    #[test]
    fn test_outcome_label() {
        assert_eq!(outcome_label(None), "OK");
        assert_eq!(
            outcome_label(Some(&Status::internal("boom"))),
            "Internal Server Error"
        );
        assert_eq!(outcome_label(Some(&Status::invalid_argument("x"))), "Bad Request");
    }
}
