//! Pull-based binding stream contract and the leaf streams every plan starts from.
//!
//! Streams are forward-only and single-pass. `close` releases the stream and
//! every stream it owns; closing twice is a no-op, and a closed stream yields
//! no further rows.

use std::vec;

use crate::query::binding::Binding;
use crate::query::context::ExecutionContext;
use crate::types::Result;

/// Physical operator interface: a lazily produced, releasable sequence of bindings.
pub trait BindingStream {
    /// Pulls the next binding, `Ok(None)` once exhausted.
    fn try_next(&mut self) -> Result<Option<Binding>>;

    /// Releases this stream and every stream it owns. Idempotent.
    fn close(&mut self);

    /// True only for the untouched root stream of a query.
    fn is_root(&self) -> bool {
        false
    }
}

/// Owned, dynamically dispatched stream.
pub type BoxBindingStream = Box<dyn BindingStream>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RootState {
    Pending,
    Consumed,
    Closed,
}

/// Yields exactly one empty binding: the input of a top-level compilation.
pub struct RootStream {
    state: RootState,
}

impl RootStream {
    /// Creates an unconsumed root stream.
    pub fn new() -> Self {
        Self {
            state: RootState::Pending,
        }
    }
}

impl Default for RootStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingStream for RootStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.state != RootState::Pending {
            return Ok(None);
        }
        self.state = RootState::Consumed;
        Ok(Some(Binding::new()))
    }

    fn close(&mut self) {
        self.state = RootState::Closed;
    }

    fn is_root(&self) -> bool {
        self.state == RootState::Pending
    }
}

/// Stream over an owned, already materialised list of bindings.
pub struct VecBindingStream {
    rows: vec::IntoIter<Binding>,
    closed: bool,
}

impl VecBindingStream {
    /// Streams `rows` in order.
    pub fn new(rows: Vec<Binding>) -> Self {
        Self {
            rows: rows.into_iter(),
            closed: false,
        }
    }

    /// Streams a single binding; seeds per-binding re-evaluation.
    pub fn singleton(binding: Binding) -> Self {
        Self::new(vec![binding])
    }
}

impl BindingStream for VecBindingStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rows = Vec::new().into_iter();
        }
    }
}

/// Stream that never yields a row.
#[derive(Default)]
pub struct NullStream;

impl NullStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        NullStream
    }
}

impl BindingStream for NullStream {
    fn try_next(&mut self) -> Result<Option<Binding>> {
        Ok(None)
    }

    fn close(&mut self) {}
}

/// Boxed root stream.
pub fn root() -> BoxBindingStream {
    Box::new(RootStream::new())
}

/// Boxed single-row stream.
pub fn singleton(binding: Binding) -> BoxBindingStream {
    Box::new(VecBindingStream::singleton(binding))
}

/// Drains `stream` into memory, checking for cancellation between rows, then closes it.
pub fn collect_bindings(
    stream: &mut dyn BindingStream,
    ctx: &ExecutionContext,
) -> Result<Vec<Binding>> {
    let mut rows = Vec::new();
    loop {
        if let Err(err) = ctx.check_cancelled() {
            stream.close();
            return Err(err);
        }
        match stream.try_next() {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break,
            Err(err) => {
                stream.close();
                return Err(err);
            }
        }
    }
    stream.close();
    Ok(rows)
}
