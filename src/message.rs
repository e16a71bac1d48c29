// 哲学者とフォーク(またはウェイター)の間でやりとりするメッセージ
// ロジックは持たない

/// フォークへのメッセージ. `A` は返信先(哲学者のメールボックス)
#[derive(Debug, Clone)]
pub enum ForkMessage<A> {
    Request { reply_to: A, philosopher: usize },
    Release,
}

/// フォークから哲学者への返信
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Granted,
    Denied,
}

impl Reply {
    pub fn name(self) -> &'static str {
        match self {
            Reply::Granted => "Granted",
            Reply::Denied => "Denied",
        }
    }
}

/// 哲学者が規定回数の食事を終えた通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub philosopher: usize,
}

/// どのフォーク宛てかを添えたメッセージ
///
/// 分散型のフォークは自分宛てのものしか受け取らないので `fork` を見ない.
/// ウェイターは全フォーク分を1つのメールボックスで受けるので `fork` で区別する
#[derive(Debug, Clone)]
pub struct ForkEnvelope<A> {
    pub fork: usize,
    pub message: ForkMessage<A>,
}

impl<A> ForkEnvelope<A> {
    pub fn request(fork: usize, reply_to: A, philosopher: usize) -> Self {
        ForkEnvelope {
            fork,
            message: ForkMessage::Request {
                reply_to,
                philosopher,
            },
        }
    }

    pub fn release(fork: usize) -> Self {
        ForkEnvelope {
            fork,
            message: ForkMessage::Release,
        }
    }
}

/// ウェイター内部で扱う (哲学者, フォーク番号) の組
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterRequest<A> {
    Request {
        reply_to: A,
        philosopher: usize,
        fork: usize,
    },
    Release {
        fork: usize,
    },
}

// フォークとウェイターの境界での変換
impl<A> From<ForkEnvelope<A>> for WaiterRequest<A> {
    fn from(envelope: ForkEnvelope<A>) -> Self {
        match envelope.message {
            ForkMessage::Request {
                reply_to,
                philosopher,
            } => WaiterRequest::Request {
                reply_to,
                philosopher,
                fork: envelope.fork,
            },
            ForkMessage::Release => WaiterRequest::Release {
                fork: envelope.fork,
            },
        }
    }
}
