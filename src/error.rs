//! 에러 타입 정의

use thiserror::Error;

use crate::name::Name;
use crate::packet::NackReason;

/// AggFlow 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("토폴로지 파싱 실패 (line {line}): {reason}")]
    Parse { line: usize, reason: String },

    #[error("Nack 수신으로 요청 실패: name={name}, reason={reason}")]
    Nack { name: Name, reason: NackReason },

    #[error("요청 타임아웃: name={name}, retries={retries}")]
    Timeout { name: Name, retries: u32 },

    #[error("유효하지 않은 버전 메타데이터: {name}")]
    InvalidMetadata { name: Name },

    #[error("콘텐츠 검증 실패: name={name}")]
    Validation { name: Name },

    #[error("세그먼트 수신 실패: name={name}, reason={reason}")]
    SegmentFailure { name: Name, reason: String },

    #[error("플로우 중단: flow={flow}, reason={reason}")]
    FlowAborted { flow: String, reason: String },

    #[error("전송 채널 종료")]
    ChannelClosed,

    #[error("알 수 없는 에러: {0}")]
    Unknown(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
