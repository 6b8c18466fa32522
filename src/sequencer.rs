//! 청크 시퀀서
//!
//! 플로우 하나의 청크를 0번부터 순서대로 수집한다.
//! 청크 n의 파이프라인이 "더 보낼 것 없음" 신호를 주면 n+1로 진행하고,
//! 꼬리 재전송은 다음 청크와 겹쳐서 마저 끝낸다.
//! 완료된 청크의 세그먼트 맵은 FlowController로 전달된다

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::Config;
use crate::controller::{ChunkPayload, FlowController};
use crate::discover;
use crate::error::{Error, Result};
use crate::face::Face;
use crate::name::Name;
use crate::pipeline::{FlowState, SegmentPipeline};
use crate::stats::StatsRegistry;

/// 플로우 하나의 청크 진행을 맡는 시퀀서
pub struct ChunkSequencer {
    face: Face,
    flow: String,
    base_name: Name,
    config: Arc<Config>,
    state: Arc<FlowState>,
    controller: Arc<FlowController>,
    stats: Arc<StatsRegistry>,
}

impl ChunkSequencer {
    /// 리프 관심 이름(트리 직렬화 포함) 하나로 시퀀서 생성
    pub fn new(
        face: Face,
        base_name: Name,
        config: Arc<Config>,
        controller: Arc<FlowController>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let flow = base_name.flow_id().unwrap_or_default().to_string();
        let state = FlowState::new(&config);
        Self {
            face,
            flow,
            base_name,
            config,
            state,
            controller,
            stats,
        }
    }

    /// 플로우 이름
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// 전체 청크를 순서대로 수집
    ///
    /// 청크 하나라도 최종 실패하면 플로우 전체를 중단한다
    pub async fn run(self) -> Result<()> {
        let total = self.config.total_chunks;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(u64, Result<ChunkPayload>)>();
        let mut delivered: u64 = 0;

        for chunk_no in 0..total {
            let chunk_name = self.base_name.clone().append_chunk(chunk_no);
            let versioned = discover::discover_version(&self.face, chunk_name, &self.config)
                .await
                .map_err(|e| self.abort(e))?;

            debug!("플로우 {} 청크 #{} 시작: {}", self.flow, chunk_no, versioned);

            let pipeline = SegmentPipeline::new(
                self.face.clone(),
                versioned,
                self.config.clone(),
                self.state.clone(),
                self.controller.clone(),
                self.stats.clone(),
            );
            let (proceed_tx, proceed_rx) = oneshot::channel();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let result = pipeline.run(proceed_tx).await;
                let _ = done_tx.send((chunk_no, result));
            });

            // 진행 신호를 기다리되, 그 사이 끝나는 앞선 청크들 먼저 처리
            let mut proceed = Some(proceed_rx);
            loop {
                match proceed.take() {
                    Some(mut proceed_rx) => {
                        tokio::select! {
                            signal = &mut proceed_rx => {
                                if signal.is_ok() {
                                    break;
                                }
                                // 신호 없이 종료 = 파이프라인 실패.
                                // 완료 채널에서 실패를 판정한다
                            }
                            Some((done_no, result)) = done_rx.recv() => {
                                self.deliver(done_no, result, &mut delivered)?;
                                proceed = Some(proceed_rx);
                            }
                        }
                    }
                    None => {
                        let Some((done_no, result)) = done_rx.recv().await else {
                            return Err(self.abort(Error::ChannelClosed));
                        };
                        self.deliver(done_no, result, &mut delivered)?;
                    }
                }
            }
        }

        drop(done_tx);

        // 꼬리 파이프라인들의 완료 대기
        while delivered < total {
            let Some((done_no, result)) = done_rx.recv().await else {
                return Err(self.abort(Error::ChannelClosed));
            };
            self.deliver(done_no, result, &mut delivered)?;
        }

        info!("플로우 {} 전체 {}개 청크 완료", self.flow, total);
        Ok(())
    }

    fn deliver(
        &self,
        chunk_no: u64,
        result: Result<ChunkPayload>,
        delivered: &mut u64,
    ) -> Result<()> {
        match result {
            Ok(payload) => {
                self.controller.add_chunk(&self.flow, chunk_no, payload);
                *delivered += 1;
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn abort(&self, cause: Error) -> Error {
        Error::FlowAborted {
            flow: self.flow.clone(),
            reason: cause.to_string(),
        }
    }
}
