//! 단일 요청 페처
//!
//! 이름 하나에 대한 요청을 타임아웃/Nack 정책에 따라 재시도.
//! - Duplicate Nack: 새 nonce로 즉시 재전송, 소진 카운터에 반영 안 함
//! - Congestion Nack: 지수 백오프 후 재전송, 백오프 카운터는 상한 없음
//! - 그 외 Nack: 연속 횟수가 상한을 넘으면 실패
//! - 타임아웃: 새 nonce로 재전송, 누적 횟수가 상한을 넘으면 실패
//!
//! 취소는 반환된 future를 드롭하면 된다

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::face::{Face, FaceReply};
use crate::packet::{Data, Interest, NackReason};

/// 재시도 무제한
pub const MAX_RETRIES_INFINITE: i32 = -1;

/// 혼잡 백오프 상한
const MAX_CONGESTION_BACKOFF: Duration = Duration::from_millis(10_000);

/// 혼잡 Nack n번째(0부터)의 백오프: 2, 4, 8, ... ms, 10초 상한
fn congestion_backoff(n_congestion: u32) -> Duration {
    if n_congestion >= 13 {
        return MAX_CONGESTION_BACKOFF;
    }
    let ms = 1u64 << (n_congestion + 1);
    Duration::from_millis(ms).min(MAX_CONGESTION_BACKOFF)
}

/// 요청 하나를 응답이 올 때까지 정책에 따라 재시도
pub async fn fetch(
    face: &Face,
    mut interest: Interest,
    max_nack_retries: i32,
    max_timeout_retries: i32,
) -> Result<Data> {
    let mut n_nacks: i32 = 0;
    let mut n_timeouts: i32 = 0;
    let mut n_congestion: u32 = 0;

    loop {
        match face.express(&interest).await? {
            FaceReply::Data(data) => return Ok(data),

            FaceReply::Nack(nack) => match nack.reason {
                NackReason::Duplicate => {
                    debug!("Duplicate Nack, 새 nonce로 재전송: {}", interest.name);
                    n_nacks = 0;
                    interest.refresh_nonce();
                }
                NackReason::Congestion => {
                    let backoff = congestion_backoff(n_congestion);
                    n_congestion += 1;
                    n_nacks = 0;
                    debug!(
                        "Congestion Nack, {:?} 백오프 후 재전송: {}",
                        backoff, interest.name
                    );
                    tokio::time::sleep(backoff).await;
                    interest.refresh_nonce();
                }
                reason => {
                    n_nacks += 1;
                    if max_nack_retries != MAX_RETRIES_INFINITE && n_nacks > max_nack_retries {
                        warn!(
                            "Nack 재시도 한도({}) 초과: {} (reason={})",
                            max_nack_retries, interest.name, reason
                        );
                        return Err(Error::Nack {
                            name: interest.name,
                            reason,
                        });
                    }
                    debug!(
                        "Nack(reason={}) {}회째, 재전송: {}",
                        reason, n_nacks, interest.name
                    );
                    interest.refresh_nonce();
                }
            },

            FaceReply::Timeout => {
                n_timeouts += 1;
                if max_timeout_retries != MAX_RETRIES_INFINITE && n_timeouts > max_timeout_retries
                {
                    warn!(
                        "타임아웃 재시도 한도({}) 초과: {}",
                        max_timeout_retries, interest.name
                    );
                    return Err(Error::Timeout {
                        name: interest.name,
                        retries: n_timeouts as u32,
                    });
                }
                debug!("타임아웃 {}회째, 재전송: {}", n_timeouts, interest.name);
                interest.refresh_nonce();
            }
        }
    }
}
