//! Reverse-order cleanup for multi-stage host mutation.
//!
//! Each completed stage registers how to undo itself. If the guard is
//! dropped or explicitly rolled back before `commit`, the undo actions run
//! last-registered first. A failing or panicking action is logged and the
//! rest still run.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, info, warn};

use wapt_logging::targets::T_SESSION as TARGET;

type RollbackAction<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + 'a>;

pub struct RollbackGuard<'a> {
    name: String,
    stack: Vec<(&'static str, RollbackAction<'a>)>,
    committed: bool,
}

impl<'a> RollbackGuard<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        info!(target: TARGET, name = %name, "starting transaction");
        Self {
            name,
            stack: Vec::new(),
            committed: false,
        }
    }

    pub fn register<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'a,
    {
        self.stack.push((label, Box::new(action)));
    }

    pub fn commit(mut self) {
        info!(target: TARGET, name = %self.name, stages = self.stack.len(), "transaction committed");
        self.committed = true;
        self.stack.clear();
    }

    /// Runs every pending undo action now. Returns the failures.
    pub fn rollback(&mut self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        if self.committed {
            warn!(target: TARGET, name = %self.name, "rollback called on committed transaction");
            return errors;
        }

        info!(target: TARGET, name = %self.name, actions = self.stack.len(), "rolling back");
        while let Some((label, action)) = self.stack.pop() {
            match catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => info!(target: TARGET, step = label, "undone"),
                Ok(Err(e)) => {
                    error!(target: TARGET, step = label, error = %e, "undo failed");
                    errors.push(e.context(label));
                }
                Err(payload) => {
                    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    error!(target: TARGET, step = label, panic = %msg, "undo panicked");
                    errors.push(anyhow::anyhow!("{label}: undo panicked: {msg}"));
                }
            }
        }
        errors
    }

    pub fn pending_actions(&self) -> usize {
        self.stack.len()
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.stack.is_empty() {
            warn!(target: TARGET, name = %self.name, "dropped without commit; rolling back");
            let errors = self.rollback();
            if !errors.is_empty() {
                error!(target: TARGET, name = %self.name, error_count = errors.len(), "rollback incomplete");
            }
        }
    }
}
