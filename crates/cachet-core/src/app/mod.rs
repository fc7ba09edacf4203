//! App - アプリケーション層
//!
//! ports と pool を組み合わせてオーケストレーションを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 起動時検証とワイヤリング
//! - **AppContext**: analyze / publish / fetch_signed / sweep の表面
//! - **GcLoop**: 期限切れ artifact と購読の定期回収
//! - **retrieval**: 署名付き取得（失敗はすべて NotFound）
//! - **publisher**: 上書き時の fan-out

pub mod builder;
pub mod context;
pub mod gc_loop;
mod publisher;
pub mod retrieval;

// 主要な型を再エクスポート
pub use self::builder::{AppBuilder, BuildError};
pub use self::context::{AppContext, PublishReceipt};
pub use self::gc_loop::{GcLoop, SweepReport};
pub use self::retrieval::{RetrievalError, Retrieved};
