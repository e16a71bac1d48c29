//! 食事する哲学者の問題を、フォークの割り当て方を変えながら解く.
//!
//! 哲学者・フォーク・ウェイターはどれも入力を受けて出力を返すだけの状態機械で、
//! 実際に動かすのは次の3つの実行系のどれか.
//!
//! - [`actor`]: 1人1つの tokio タスク
//! - [`csp`]: 1人1スレッドとブロッキングチャネル
//! - [`sim`]: 1スレッドで仮想時間を進める再現可能なシミュレーション

pub mod actor;
pub mod channel;
pub mod csp;
pub mod error;
pub mod fork;
pub mod message;
pub mod observer;
pub mod pause;
pub mod philosopher;
pub mod semaphore;
pub mod sim;
pub mod table;
pub mod waiter;

pub use error::{Error, Result};
pub use observer::{LogTrace, RecordingTrace, RunSummary, TraceEvent, TraceSink};
pub use philosopher::PhilosopherState;
pub use sim::{simulate, SimReport};
pub use table::{Policy, TableConfig};
