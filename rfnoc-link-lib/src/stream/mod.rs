//! Flow-controlled data transports between host and device stream
//! endpoints.

mod fc;
mod rx;
mod tx;

pub use fc::{RxFcState, SeqCheck, StreamBuffParams, TxFcState};
pub use rx::{ChdrRxStream, RxPacket};
pub use tx::{ChdrTxStream, CommitOutcome, SendMeta};

/// Asynchronous flow events reported by the far end (or detected
/// locally on receive). Polled with `recv_async_msg`; never raised as
/// errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A sequence gap: the burst must be ended and resynchronized.
    SeqError { info: u64 },
    /// Data integrity error at the receiver.
    DataError { info: u64 },
    /// A timed command arrived after its timestamp had passed.
    LateCommand { info: u64 },
    /// The receiver rejected a malformed command.
    CmdError { info: u64 },
}
