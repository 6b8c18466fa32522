//! 전송 엔드포인트 (Face)
//!
//! 인코딩된 Interest를 전달 계층(포워더 바인딩 또는 인프로세스 루프백)에
//! 넘기고, 응답을 Data/Nack/타임아웃으로 해석하는 요청 채널.
//! face 하나가 스펙의 전송 엔드포인트 하나에 대응

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{Error, Result};
use crate::packet::{Data, Interest, Nack, Packet};

/// face 요청 하나의 결과
#[derive(Debug)]
pub enum FaceReply {
    /// 데이터 도착
    Data(Data),

    /// 부정 응답 도착
    Nack(Nack),

    /// 요청 수명 내 응답 없음
    Timeout,
}

/// face로 들어온 요청 (전달 계층이 소비)
#[derive(Debug)]
pub struct FaceRequest {
    /// 인코딩된 Interest 패킷
    pub wire: Vec<u8>,

    /// 응답 채널 (인코딩된 Data/Nack 패킷).
    /// 응답 없이 버리면 요청은 타임아웃으로 처리됨
    pub reply_tx: oneshot::Sender<Vec<u8>>,
}

impl FaceRequest {
    /// 요청을 Interest로 디코딩
    pub fn interest(&self) -> Result<Interest> {
        match Packet::from_bytes(&self.wire)? {
            Packet::Interest(interest) => Ok(interest),
            other => Err(Error::Unknown(format!(
                "face 요청이 Interest가 아님: {:?}",
                other.packet_type()
            ))),
        }
    }

    /// 데이터로 응답
    pub fn reply_data(self, data: Data) {
        let _ = self.reply_tx.send(Packet::Data(data).to_bytes());
    }

    /// Nack으로 응답
    pub fn reply_nack(self, nack: Nack) {
        let _ = self.reply_tx.send(Packet::Nack(nack).to_bytes());
    }
}

/// 요청 수신측 채널 타입
pub type FaceServer = mpsc::Receiver<FaceRequest>;

/// 전송 엔드포인트
#[derive(Debug, Clone)]
pub struct Face {
    id: usize,
    tx: mpsc::Sender<FaceRequest>,
}

impl Face {
    /// face와 그 요청 수신측 쌍 생성
    pub fn channel(id: usize, capacity: usize) -> (Self, FaceServer) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { id, tx }, rx)
    }

    /// face 식별자
    pub fn id(&self) -> usize {
        self.id
    }

    /// 요청 하나를 내보내고 응답을 기다림
    ///
    /// Interest 수명 안에 응답이 없으면 `FaceReply::Timeout`.
    /// 응답 채널이 응답 없이 닫혀도 타임아웃으로 간주
    pub async fn express(&self, interest: &Interest) -> Result<FaceReply> {
        let wire = Packet::Interest(interest.clone()).to_bytes();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(FaceRequest { wire, reply_tx })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        match tokio::time::timeout(interest.lifetime(), reply_rx).await {
            Err(_) => Ok(FaceReply::Timeout),
            Ok(Err(_)) => Ok(FaceReply::Timeout),
            Ok(Ok(bytes)) => match Packet::from_bytes(&bytes) {
                Ok(Packet::Data(data)) => Ok(FaceReply::Data(data)),
                Ok(Packet::Nack(nack)) => Ok(FaceReply::Nack(nack)),
                Ok(Packet::Interest(_)) => {
                    Err(Error::Unknown("face 응답으로 Interest 수신".into()))
                }
                Err(e) => {
                    warn!("face #{} 응답 디코딩 실패: {}", self.id, e);
                    Err(e)
                }
            },
        }
    }
}
