//! 프로토콜 패킷 정의
//!
//! - Interest: 이름으로 콘텐츠를 당겨오는 요청
//! - Data: 세그먼트 하나를 담은 응답
//! - Nack: 데이터 대신 돌아오는 부정 응답

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::{MAGIC_NUMBER, PROTOCOL_VERSION};

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// 요청
    Interest = 1,

    /// 데이터 응답
    Data = 2,

    /// 부정 응답
    Nack = 3,
}

/// 패킷 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 패킷 타입
    pub packet_type: PacketType,

    /// 페이로드 길이 (헤더 제외)
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            packet_type,
            payload_len,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: self.magic,
            });
        }
        if self.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

fn frame(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let header = PacketHeader::new(packet_type, payload.len() as u32);
    let header_bytes = bincode::serialize(&header).unwrap_or_default();

    let mut buf = Vec::with_capacity(header_bytes.len() + payload.len());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(payload);
    buf
}

/// 관심 패킷 (요청)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interest {
    /// 요청 이름
    pub name: Name,

    /// 요청 식별자 (재전송 시 갱신)
    pub nonce: u32,

    /// 캐시 응답 거부 여부
    pub must_be_fresh: bool,

    /// 접두사 매칭 허용 여부 (디스커버리용)
    pub can_be_prefix: bool,

    /// 요청 수명 (밀리초)
    pub lifetime_ms: u64,
}

impl Interest {
    /// 새 요청 생성 (무작위 nonce)
    pub fn new(name: Name) -> Self {
        Self {
            name,
            nonce: rand::random(),
            must_be_fresh: false,
            can_be_prefix: false,
            lifetime_ms: 4000,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime_ms = lifetime.as_millis() as u64;
        self
    }

    pub fn with_must_be_fresh(mut self, fresh: bool) -> Self {
        self.must_be_fresh = fresh;
        self
    }

    pub fn with_can_be_prefix(mut self, prefix: bool) -> Self {
        self.can_be_prefix = prefix;
        self
    }

    /// 요청 수명
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }

    /// 재전송용 새 식별자 발급
    pub fn refresh_nonce(&mut self) {
        self.nonce = rand::random();
    }
}

/// 데이터 패킷 (응답)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    /// 데이터 이름
    pub name: Name,

    /// 콘텐츠 바이트
    pub content: Bytes,

    /// 콘텐츠의 마지막 세그먼트 번호 (알려진 경우)
    pub final_block_id: Option<u64>,

    /// freshness 기간 (밀리초)
    pub freshness_ms: u64,

    /// 경로상 혼잡 마크 (0이면 없음)
    pub congestion_mark: u64,

    /// 콘텐츠 CRC32 체크섬
    pub crc32: u32,
}

impl Data {
    /// 새 데이터 패킷 생성 (CRC 계산 포함)
    pub fn new(name: Name, content: Bytes) -> Self {
        let crc32 = crc32fast::hash(&content);
        Self {
            name,
            content,
            final_block_id: None,
            freshness_ms: 4000,
            congestion_mark: 0,
            crc32,
        }
    }

    pub fn with_final_block_id(mut self, final_block_id: u64) -> Self {
        self.final_block_id = Some(final_block_id);
        self
    }

    pub fn with_congestion_mark(mut self, mark: u64) -> Self {
        self.congestion_mark = mark;
        self
    }

    /// 콘텐츠 무결성 검증
    pub fn verify_digest(&self) -> bool {
        crc32fast::hash(&self.content) == self.crc32
    }
}

/// Nack 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    /// 동일 nonce 중복 요청
    Duplicate,

    /// 경로 혼잡
    Congestion,

    /// 경로 없음
    NoRoute,

    /// 사유 미상
    Unspecified,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NackReason::Duplicate => "Duplicate",
            NackReason::Congestion => "Congestion",
            NackReason::NoRoute => "NoRoute",
            NackReason::Unspecified => "Unspecified",
        };
        write!(f, "{s}")
    }
}

/// 부정 응답 패킷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nack {
    /// 원 요청 이름
    pub name: Name,

    /// 사유
    pub reason: NackReason,
}

/// 통합 패킷 enum
#[derive(Debug, Clone)]
pub enum Packet {
    Interest(Interest),
    Data(Data),
    Nack(Nack),
}

impl Packet {
    /// 패킷 타입 반환
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Interest(_) => PacketType::Interest,
            Packet::Data(_) => PacketType::Data,
            Packet::Nack(_) => PacketType::Nack,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match self {
            Packet::Interest(p) => bincode::serialize(p),
            Packet::Data(p) => bincode::serialize(p),
            Packet::Nack(p) => bincode::serialize(p),
        }
        .unwrap_or_default();

        frame(self.packet_type(), &payload)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // 헤더를 먼저 읽고 실제 크기를 역산 (bincode는 앞에서부터 읽음)
        let header: PacketHeader = bincode::deserialize(bytes)?;
        header.validate()?;

        let header_size = bincode::serialize(&header)?.len();
        if bytes.len() < header_size {
            return Err(Error::Unknown("패킷이 헤더보다 짧음".into()));
        }
        let payload = &bytes[header_size..];

        let packet = match header.packet_type {
            PacketType::Interest => Packet::Interest(bincode::deserialize(payload)?),
            PacketType::Data => Packet::Data(bincode::deserialize(payload)?),
            PacketType::Nack => Packet::Nack(bincode::deserialize(payload)?),
        };
        Ok(packet)
    }
}
