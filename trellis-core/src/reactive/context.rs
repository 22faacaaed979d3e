//! Run Context
//!
//! The run context tracks which effect or operation is currently executing
//! on this thread. The store reads it to label dispatches made from inside
//! a callback. Whether an effect or operation is already running is kept
//! on the effect or executor itself, since runs may land on any thread.
//!
//! # Implementation
//!
//! We use a thread-local stack. Entering a run (an effect or operation
//! callback) pushes a frame; the returned guard pops it when dropped, so
//! the stack stays balanced even if the callback panics.
//!
//! Nesting happens when a callback drives a scheduler inline (for instance
//! a test draining a [`ManualScheduler`](super::ManualScheduler) from inside
//! an effect).

use std::cell::RefCell;
use std::sync::Arc;

use crate::id::Token;

thread_local! {
    static RUN_STACK: RefCell<Vec<RunFrame>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the run stack.
#[derive(Debug, Clone)]
struct RunFrame {
    /// The effect or operation being run.
    token: Token,
    /// Label used as the dispatcher of transactions issued by this run.
    label: Arc<str>,
}

/// Guard that pops the frame when dropped.
pub struct RunContext {
    token: Token,
}

impl RunContext {
    /// Enter a run for `token`.
    pub fn enter(token: Token, label: &str) -> Self {
        RUN_STACK.with(|stack| {
            stack.borrow_mut().push(RunFrame {
                token,
                label: Arc::from(label),
            });
        });

        Self { token }
    }

    /// Label of the innermost run, if any.
    pub fn current_label() -> Option<String> {
        RUN_STACK.with(|stack| stack.borrow().last().map(|frame| frame.label.to_string()))
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        RUN_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.token, self.token,
                    "RunContext mismatch: expected {:?}, got {:?}",
                    self.token, frame.token
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_current_run() {
        let token = Token::next();

        assert!(RunContext::current_label().is_none());

        {
            let _ctx = RunContext::enter(token, "effect:render");
            assert_eq!(RunContext::current_label().as_deref(), Some("effect:render"));
        }

        assert!(RunContext::current_label().is_none());
    }

    #[test]
    fn nested_contexts() {
        let outer = Token::next();
        let inner = Token::next();

        {
            let _outer = RunContext::enter(outer, "outer");
            {
                let _inner = RunContext::enter(inner, "inner");
                assert_eq!(RunContext::current_label().as_deref(), Some("inner"));
            }

            assert_eq!(RunContext::current_label().as_deref(), Some("outer"));
        }

        assert!(RunContext::current_label().is_none());
    }
}
