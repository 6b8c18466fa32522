//! 버전 디스커버리
//!
//! 이름 접두사 아래 최신 발행 버전을 해석한다.
//! 디스커버리가 꺼져 있거나 이름이 이미 버전으로 끝나면 그대로 통과

use bytes::Bytes;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::face::Face;
use crate::fetcher;
use crate::name::Name;
use crate::packet::Interest;

/// 메타데이터 요청의 키워드 컴포넌트
pub const METADATA_COMPONENT: &str = "metadata";

/// 메타데이터 콘텐츠 인코딩 (생산자측에서 사용)
pub fn encode_versioned_name(name: &Name) -> Bytes {
    Bytes::from(bincode::serialize(name).unwrap_or_default())
}

/// 접두사의 최신 버전 이름 해석
pub async fn discover_version(face: &Face, prefix: Name, config: &Config) -> Result<Name> {
    if config.disable_version_discovery || prefix.ends_with_version() {
        return Ok(prefix);
    }

    let interest = Interest::new(prefix.clone().append_str(METADATA_COMPONENT))
        .with_can_be_prefix(true)
        .with_must_be_fresh(true)
        .with_lifetime(config.interest_lifetime);

    let data = fetcher::fetch(
        face,
        interest,
        config.max_retries_on_timeout_or_nack,
        config.max_retries_on_timeout_or_nack,
    )
    .await?;

    // 메타데이터 콘텐츠는 버전 이름의 직렬화본
    let versioned: Name = bincode::deserialize(&data.content)
        .map_err(|_| Error::InvalidMetadata {
            name: prefix.clone(),
        })?;

    if versioned.is_empty() || !versioned.ends_with_version() {
        return Err(Error::InvalidMetadata { name: versioned });
    }

    debug!("버전 확인: {} -> {}", prefix, versioned);
    Ok(versioned)
}
