//! 플로우 팬아웃
//!
//! 집계 트리의 리프(루트 직계 자식)마다 플로우 하나를 만들고,
//! 리프 i를 face `i mod M`에 배정한다. 모든 리프의 init 핸드셰이크가
//! 끝난 뒤에야 청크 수집을 시작하고, 플로우 하나가 최종 실패하면
//! 전체를 중단한다

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::controller::{ChunkReceiver, FlowController};
use crate::error::{Error, Result};
use crate::face::Face;
use crate::fetcher;
use crate::name::Name;
use crate::packet::Interest;
use crate::sequencer::ChunkSequencer;
use crate::stats::StatsRegistry;
use crate::tree::AggTree;

/// 핸드셰이크 요청의 끝 컴포넌트
pub const INIT_COMPONENT: &str = "init";

/// 멀티플로우 수집 팬아웃
pub struct FlowFanout {
    interest_names: Vec<Name>,
    faces: Vec<Face>,
    config: Arc<Config>,
    controller: Arc<FlowController>,
    stats: Arc<StatsRegistry>,
}

impl FlowFanout {
    /// 트리의 루트 직계 자식들로 팬아웃 구성
    ///
    /// 반환된 수신 채널로 병합 청크가 번호 순으로 흘러나온다
    pub fn new(
        tree: &AggTree,
        faces: Vec<Face>,
        config: Arc<Config>,
        stats: Arc<StatsRegistry>,
    ) -> Result<(Self, ChunkReceiver)> {
        if faces.is_empty() {
            return Err(Error::Unknown("face가 하나도 없음".into()));
        }

        let interest_names = tree.interest_names(&config.root_node);
        if interest_names.is_empty() {
            return Err(Error::Unknown(format!(
                "루트 노드 {}의 자식이 없음",
                config.root_node
            )));
        }

        let flow_names: Vec<String> = interest_names
            .iter()
            .filter_map(|name| name.flow_id().map(str::to_string))
            .collect();

        info!(
            "팬아웃 구성: {}개 플로우, {}개 face",
            flow_names.len(),
            faces.len()
        );

        let (controller, chunk_rx) = FlowController::new(flow_names, config.table_size);

        Ok((
            Self {
                interest_names,
                faces,
                config,
                controller,
                stats,
            },
            chunk_rx,
        ))
    }

    /// 교차 플로우 컨트롤러 핸들
    pub fn controller(&self) -> Arc<FlowController> {
        self.controller.clone()
    }

    /// 리프 i에 배정된 face
    fn face_for(&self, leaf_index: usize) -> Face {
        self.faces[leaf_index % self.faces.len()].clone()
    }

    /// 핸드셰이크 후 전체 플로우의 청크 수집을 끝까지 수행
    pub async fn run(self) -> Result<()> {
        self.handshake().await?;

        let mut set = JoinSet::new();
        for (i, name) in self.interest_names.iter().enumerate() {
            let sequencer = ChunkSequencer::new(
                self.face_for(i),
                name.clone(),
                self.config.clone(),
                self.controller.clone(),
                self.stats.clone(),
            );
            debug!("플로우 {} 시작 (face #{})", sequencer.flow(), i % self.faces.len());
            set.spawn(sequencer.run());
        }

        let mut first_error: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // 플로우 하나의 최종 실패는 전체 중단
                    error!("플로우 실패로 전체 수집 중단: {}", e);
                    first_error = Some(e);
                    set.abort_all();
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    error!("플로우 태스크 비정상 종료: {}", join_err);
                    first_error = Some(Error::Unknown(join_err.to_string()));
                    set.abort_all();
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        // 버퍼에 남은 완성 청크 정리
        self.controller.process_available_chunks();
        info!("모든 플로우 수집 완료");
        Ok(())
    }

    /// 리프마다 init 요청을 보내고 전부 도착할 때까지 대기
    async fn handshake(&self) -> Result<()> {
        info!("핸드셰이크 시작: {}개 리프", self.interest_names.len());

        let mut set = JoinSet::new();
        for (i, name) in self.interest_names.iter().enumerate() {
            let face = self.face_for(i);
            let flow = name.flow_id().unwrap_or_default().to_string();
            let interest = Interest::new(name.clone().append_str(INIT_COMPONENT))
                .with_must_be_fresh(true)
                .with_lifetime(self.config.interest_lifetime);
            let retries = self.config.max_retries_on_timeout_or_nack;

            set.spawn(async move {
                let result = fetcher::fetch(&face, interest, retries, retries).await;
                (flow, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (flow, result) = joined.map_err(|e| Error::Unknown(e.to_string()))?;
            match result {
                Ok(_) => debug!("핸드셰이크 완료: {}", flow),
                Err(e) => {
                    return Err(Error::FlowAborted {
                        flow,
                        reason: format!("핸드셰이크 실패: {e}"),
                    });
                }
            }
        }

        info!("모든 리프 핸드셰이크 완료");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::FaceServer;
    use crate::name::Component;
    use crate::packet::{Data, Nack, NackReason};
    use bytes::Bytes;
    use std::time::Duration;

    const TOPOLOGY: &str = "\
[links]
con0:agg1 bw=10
con0:agg2 bw=10
agg1:pro1 bw=10
agg1:pro2 bw=10
";

    fn test_config(total_chunks: u64) -> Arc<Config> {
        Arc::new(Config {
            total_chunks,
            num_faces: 2,
            interest_lifetime: Duration::from_millis(300),
            rto_check_interval: Duration::from_millis(5),
            max_retries_on_timeout_or_nack: 3,
            ..Config::default()
        })
    }

    /// 리프/청크마다 결정적 콘텐츠를 세그먼트로 나눠 응답하는 생산자.
    /// `fail_flow`의 세그먼트 요청에는 NoRoute로 응답
    fn spawn_producer(
        mut server: FaceServer,
        segments_per_chunk: u64,
        segment_size: usize,
        fail_flow: Option<String>,
    ) {
        tokio::spawn(async move {
            while let Some(req) = server.recv().await {
                let interest = match req.interest() {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let name = interest.name.clone();
                let flow = name.flow_id().unwrap_or_default().to_string();

                // 핸드셰이크
                if matches!(name.last(), Some(Component::Generic(c)) if c == INIT_COMPONENT) {
                    req.reply_data(Data::new(name, Bytes::from_static(b"init-ack")));
                    continue;
                }

                // 세그먼트 요청: [flow, (structure)?, chunk_no, seg=k]
                let Some(seg_no) = name.segment() else {
                    continue;
                };
                let chunk_no: u64 = (0..name.len())
                    .filter_map(|i| match name.get(i) {
                        Some(Component::Generic(s)) => s.parse().ok(),
                        _ => None,
                    })
                    .next_back()
                    .unwrap_or(0);

                if fail_flow.as_deref() == Some(flow.as_str()) {
                    req.reply_nack(Nack {
                        name,
                        reason: NackReason::NoRoute,
                    });
                    continue;
                }

                let last = segments_per_chunk - 1;
                if seg_no > last {
                    req.reply_nack(Nack {
                        name,
                        reason: NackReason::NoRoute,
                    });
                    continue;
                }

                // 플로우별로 값이 달라 병합 평균을 검증할 수 있음
                let fill = (chunk_no * 10 + seg_no) as u8 + flow.len() as u8;
                req.reply_data(
                    Data::new(name, Bytes::from(vec![fill; segment_size]))
                        .with_final_block_id(last),
                );
            }
        });
    }

    fn make_faces(n: usize) -> (Vec<Face>, Vec<FaceServer>) {
        (0..n).map(|i| Face::channel(i, 64)).unzip()
    }

    #[tokio::test]
    async fn test_fanout_end_to_end() {
        let config = test_config(3);
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        let (faces, servers) = make_faces(2);
        for server in servers {
            spawn_producer(server, 2, 8, None);
        }

        let stats = Arc::new(StatsRegistry::new());
        let (fanout, mut chunk_rx) =
            FlowFanout::new(&tree, faces, config, stats.clone()).unwrap();
        assert_eq!(fanout.controller().flow_count(), 2);

        fanout.run().await.unwrap();

        // 청크가 번호 순으로, 두 플로우의 평균으로 방출됨
        for expected in 0..3u64 {
            let merged = chunk_rx.recv().await.unwrap();
            assert_eq!(merged.chunk_no, expected);
            let bytes = merged.into_bytes();
            assert_eq!(bytes.len(), 16);
            // agg1(len 4)과 agg2(len 4)의 fill 값이 같아 평균도 같은 값
            let fill_seg0 = (expected * 10) as u8 + 4;
            let fill_seg1 = fill_seg0 + 1;
            assert!(bytes[..8].iter().all(|&b| b == fill_seg0));
            assert!(bytes[8..].iter().all(|&b| b == fill_seg1));
        }

        assert_eq!(stats.get("agg1").unwrap().chunks_completed, 3);
        assert_eq!(stats.get("agg2").unwrap().chunks_completed, 3);
    }

    #[tokio::test]
    async fn test_fanout_aborts_all_on_flow_failure() {
        let config = test_config(5);
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        let (faces, servers) = make_faces(2);
        // agg2 리프는 face 1에 배정되므로 두 서버 모두 agg2만 실패시킴
        for server in servers {
            spawn_producer(server, 2, 8, Some("agg2".to_string()));
        }

        let stats = Arc::new(StatsRegistry::new());
        let (fanout, _chunk_rx) = FlowFanout::new(&tree, faces, config, stats).unwrap();

        let err = fanout.run().await.unwrap_err();
        assert!(matches!(err, Error::FlowAborted { flow, .. } if flow == "agg2"));
    }

    #[tokio::test]
    async fn test_fanout_fails_on_handshake_timeout() {
        let config = Arc::new(Config {
            total_chunks: 1,
            interest_lifetime: Duration::from_millis(20),
            max_retries_on_timeout_or_nack: 1,
            ..Config::default()
        });
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        let (faces, servers) = make_faces(2);
        // 응답하지 않는 생산자: 핸드셰이크가 재시도 끝에 실패
        for mut server in servers {
            tokio::spawn(async move { while server.recv().await.is_some() {} });
        }

        let stats = Arc::new(StatsRegistry::new());
        let (fanout, _chunk_rx) = FlowFanout::new(&tree, faces, config, stats).unwrap();

        let err = fanout.run().await.unwrap_err();
        assert!(matches!(err, Error::FlowAborted { .. }));
    }

    #[tokio::test]
    async fn test_fanout_requires_known_root() {
        let tree = AggTree::parse(TOPOLOGY).unwrap();
        let (faces, _servers) = make_faces(1);
        let config = Arc::new(Config {
            root_node: "nope".to_string(),
            ..Config::default()
        });
        let stats = Arc::new(StatsRegistry::new());
        assert!(FlowFanout::new(&tree, faces, config, stats).is_err());
    }
}
