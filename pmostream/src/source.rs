//! Upstream audio fetch abstraction

use crate::error::Result;
use crate::readable::AudioBody;
use async_trait::async_trait;
use std::fmt::Debug;

/// Something that can open a fresh continuous audio body on demand.
///
/// Each call to [`open`](AudioSource::open) is an independent fetch; the
/// stream calls it again after every premature close.
#[async_trait]
pub trait AudioSource: Send + Sync + Debug {
    async fn open(&self) -> Result<AudioBody>;

    /// Human-readable target, used in logs and connect errors.
    fn describe(&self) -> String;
}
