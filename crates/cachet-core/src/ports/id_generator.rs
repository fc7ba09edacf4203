//! IdGenerator port - random 名前空間の ID 生成
//!
//! content-hash id は内容から決まるので generator を通さない。
//! ここで作るのは dedup キーを持たない artifact 用の id だけ。

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ArtifactId;
use crate::ports::Clock;

/// IdGenerator は random 名前空間の ArtifactId を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_artifact_id(&self) -> ArtifactId;
}

/// ULID ベースの ID 生成器
///
/// Clock の時刻を timestamp 部分に使うので、FixedClock を渡すと
/// timestamp 部分が固定された id になる（ランダム部分は毎回異なる）。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_artifact_id(&self) -> ArtifactId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        ArtifactId::random(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<G: IdGenerator + ?Sized> IdGenerator for Arc<G> {
    fn generate_artifact_id(&self) -> ArtifactId {
        (**self).generate_artifact_id()
    }
}
