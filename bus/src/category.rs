//! Command categories, registration constraints, and alias resolution.
//!
//! A category is a namespace of commands sharing an access policy, an
//! optional worker-thread reservation, and a bounded queue of jobs waiting
//! for a worker. The registry is assembled before start and never changes
//! afterwards (handlers and policies are immutable once the proxy owns it);
//! only the scheduling fields mutate at runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::auth::Access;
use crate::error::ConfigError;
use crate::message::Message;
use crate::workers::Job;

/// Maximum length of a category name.
pub const MAX_CATEGORY_LENGTH: usize = 50;

/// Maximum length of a command name.
pub const MAX_COMMAND_LENGTH: usize = 200;

/// Registered callback for a command.
pub type CommandHandler = Arc<dyn Fn(Message<'_>) + Send + Sync>;

/// Outcome of resolving a command token.
pub(crate) struct ResolvedCommand {
    /// Canonical category name.
    pub category: String,
    /// The category's access policy.
    pub access: Access,
    /// The registered handler.
    pub handler: CommandHandler,
}

/// A command category.
pub(crate) struct Category {
    pub access: Access,
    pub commands: HashMap<String, CommandHandler>,
    pub reserved_threads: usize,
    pub active_threads: usize,
    pub pending: VecDeque<Job>,
    /// `None` means unbounded; `Some(0)` drops whenever no worker is free.
    pub max_queue: Option<usize>,
}

/// All configured categories plus the command-alias map.
pub(crate) struct Registry {
    categories: HashMap<String, Category>,
    aliases: HashMap<String, String>,
    /// Insertion order, used for round-robin draining of pending queues.
    order: Vec<String>,
    rr_cursor: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            categories: HashMap::new(),
            aliases: HashMap::new(),
            order: Vec::new(),
            rr_cursor: 0,
        }
    }

    pub fn add_category(
        &mut self,
        name: &str,
        access: Access,
        reserved_threads: usize,
        max_queue: Option<usize>,
    ) -> Result<(), ConfigError> {
        if name.is_empty() || name.len() > MAX_CATEGORY_LENGTH || name.contains('.') {
            return Err(ConfigError::InvalidCategoryName(name.into()));
        }
        if self.categories.contains_key(name) {
            return Err(ConfigError::DuplicateCategory(name.into()));
        }

        self.categories.insert(
            name.into(),
            Category {
                access,
                commands: HashMap::new(),
                reserved_threads,
                active_threads: 0,
                pending: VecDeque::new(),
                max_queue,
            },
        );
        self.order.push(name.into());
        Ok(())
    }

    pub fn add_command(
        &mut self,
        category: &str,
        name: &str,
        handler: CommandHandler,
    ) -> Result<(), ConfigError> {
        if name.is_empty() || name.len() > MAX_COMMAND_LENGTH {
            return Err(ConfigError::InvalidCommandName(name.into()));
        }
        let cat = self
            .categories
            .get_mut(category)
            .ok_or_else(|| ConfigError::UnknownCategory(category.into()))?;
        if cat.commands.contains_key(name) {
            return Err(ConfigError::DuplicateCommand(category.into(), name.into()));
        }
        cat.commands.insert(name.into(), handler);
        Ok(())
    }

    pub fn add_alias(&mut self, from: &str, to: &str) -> Result<(), ConfigError> {
        if self.aliases.contains_key(from) {
            return Err(ConfigError::DuplicateAlias(from.into()));
        }
        self.aliases.insert(from.into(), to.into());
        Ok(())
    }

    /// Resolve a received command token to its category and handler.
    ///
    /// Applies the alias map first, rewriting `token` in place so that
    /// downstream logic (and logging) sees the canonical name. Warns and
    /// returns `None` for anything unroutable.
    pub fn resolve(&self, token: &mut String) -> Option<ResolvedCommand> {
        if let Some(target) = self.aliases.get(token.as_str()) {
            *token = target.clone();
        }

        let Some((cat_name, cmd_name)) = token.split_once('.') else {
            warn!("invalid command `{}`: no category prefix", token);
            return None;
        };
        if cat_name.is_empty() || cmd_name.is_empty() {
            warn!("invalid command `{}`", token);
            return None;
        }
        let Some(cat) = self.categories.get(cat_name) else {
            warn!("command `{}` addresses an unknown category", token);
            return None;
        };
        let Some(handler) = cat.commands.get(cmd_name) else {
            warn!("unknown command `{}`", token);
            return None;
        };

        Some(ResolvedCommand {
            category: cat_name.to_string(),
            access: cat.access,
            handler: handler.clone(),
        })
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Category> {
        self.categories.get_mut(name)
    }

    /// Sum of all categories' reserved threads (sizes the worker pool).
    pub fn reserved_total(&self) -> usize {
        self.categories.values().map(|c| c.reserved_threads).sum()
    }

    /// Sum of active threads across categories.
    pub fn active_total(&self) -> usize {
        self.categories.values().map(|c| c.active_threads).sum()
    }

    /// Pop one pending job from a category matching the predicate.
    ///
    /// Categories are visited round-robin from the last drain position so a
    /// busy category cannot starve the others.
    pub fn take_pending<F>(&mut self, pred: F) -> Option<Job>
    where
        F: Fn(&Category) -> bool,
    {
        let n = self.order.len();
        for i in 0..n {
            let idx = (self.rr_cursor + i) % n;
            let name = &self.order[idx];
            if let Some(cat) = self.categories.get_mut(name) {
                if !cat.pending.is_empty() && pred(cat) {
                    self.rr_cursor = (idx + 1) % n;
                    return cat.pending.pop_front();
                }
            }
        }
        None
    }
}
