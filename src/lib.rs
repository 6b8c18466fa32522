//! # AggFlow
//!
//! 이름 기반 네트워크의 멀티플로우 청크 수집/집계 파이프라인
//!
//! ## 핵심 특징
//! - **이름 트리 팬아웃**: 토폴로지 서브트리를 괄호/플러스 문법의 단일
//!   컴포넌트로 직렬화해 요청 하나로 깊은 팬아웃을 지정
//! - **적응형 윈도우**: AIMD / CUBIC / BIC / Hybla / Highspeed 5종 혼잡 제어
//! - **세그먼트 파이프라인**: 세그먼트별 RTO, 재전송 큐, RTT당 1회 감소(CWA)
//! - **교차 플로우 동기화**: 모든 플로우가 공급한 청크를 바이트 평균으로
//!   병합, 번호 순서로 방출
//! - **차등 pacing**: 가장 느린 플로우보다 앞서간 플로우에 백프레셔

pub mod cc;
pub mod config;
pub mod controller;
pub mod discover;
pub mod error;
pub mod face;
pub mod fanout;
pub mod fetcher;
pub mod name;
pub mod packet;
pub mod pipeline;
pub mod rtt;
pub mod sequencer;
pub mod stats;
pub mod tree;

pub use config::{Config, PipelineType, RttOptions};
pub use controller::{ChunkPayload, ChunkReceiver, FlowController, MergedChunk};
pub use error::{Error, Result};
pub use face::{Face, FaceReply, FaceRequest, FaceServer};
pub use fanout::FlowFanout;
pub use name::{Component, Name};
pub use packet::{Data, Interest, Nack, NackReason, Packet};
pub use pipeline::{FlowState, SegmentPipeline};
pub use rtt::RttEstimator;
pub use sequencer::ChunkSequencer;
pub use stats::{FlowStats, StatsRegistry};
pub use tree::AggTree;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x41464C57; // "AFLW"
