//! Command catalog: the name → descriptor table built once at server start.
//!
//! Each descriptor records the argument frames a command expects and whether
//! it runs inline on the worker thread (`Sync`) or is parked for an external
//! completer (`Deferred`). Deferred commands carry a fixed [`ReplyShape`] so
//! the worker can encode whatever payload the completer supplies.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::protocol::{Arg, ArgKind, Args, CodecError, Reply, ReplyShape};

/// Inline handler. Gets exclusive access to the worker's context (hardware
/// handles, algorithm state) and the decoded arguments.
pub type Handler<C> = Box<dyn Fn(&mut C, &Args) -> anyhow::Result<Reply> + Send>;

/// Errors raised while building a catalog.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Two descriptors with the same name.
    #[error("command '{0}' is already registered")]
    Duplicate(String),

    /// Empty command name.
    #[error("command name must not be empty")]
    EmptyName,
}

/// How a command is answered.
pub enum CommandMode<C> {
    /// Run the handler on the worker thread and reply immediately.
    Sync(Handler<C>),
    /// Park the request; reply once a completer supplies a payload.
    Deferred(ReplyShape),
}

impl<C> fmt::Debug for CommandMode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandMode::Sync(_) => f.write_str("Sync"),
            CommandMode::Deferred(shape) => write!(f, "Deferred({shape:?})"),
        }
    }
}

/// One catalog entry.
#[derive(Debug)]
pub struct CommandDescriptor<C> {
    name: String,
    arg_kinds: Vec<ArgKind>,
    mode: CommandMode<C>,
}

impl<C> CommandDescriptor<C> {
    /// Command name as sent on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument frames, in order.
    pub fn arg_kinds(&self) -> &[ArgKind] {
        &self.arg_kinds
    }

    /// Sync or deferred.
    pub fn mode(&self) -> &CommandMode<C> {
        &self.mode
    }

    /// True for commands answered by an external completer.
    pub fn is_deferred(&self) -> bool {
        matches!(self.mode, CommandMode::Deferred(_))
    }

    /// Decode the argument frames that followed the command name.
    ///
    /// Frames beyond the declared count are ignored.
    pub fn decode_args(&self, frames: &[Vec<u8>]) -> Result<Args, CodecError> {
        let mut args: Vec<Arg> = Vec::with_capacity(self.arg_kinds.len());
        for (index, kind) in self.arg_kinds.iter().enumerate() {
            let frame = frames
                .get(index)
                .ok_or(CodecError::MissingArg { index, kind: *kind })?;
            args.push(kind.decode(frame)?);
        }
        Ok(Args::new(args))
    }
}

/// Name → descriptor table.
pub struct CommandCatalog<C> {
    commands: HashMap<String, CommandDescriptor<C>>,
}

impl<C> Default for CommandCatalog<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CommandCatalog<C> {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    /// Register an inline command.
    pub fn register_sync<F>(
        &mut self,
        name: &str,
        arg_kinds: &[ArgKind],
        handler: F,
    ) -> Result<&mut Self, CatalogError>
    where
        F: Fn(&mut C, &Args) -> anyhow::Result<Reply> + Send + 'static,
    {
        self.insert(name, arg_kinds, CommandMode::Sync(Box::new(handler)))
    }

    /// Register a command answered by a completer.
    pub fn register_deferred(
        &mut self,
        name: &str,
        arg_kinds: &[ArgKind],
        shape: ReplyShape,
    ) -> Result<&mut Self, CatalogError> {
        self.insert(name, arg_kinds, CommandMode::Deferred(shape))
    }

    fn insert(
        &mut self,
        name: &str,
        arg_kinds: &[ArgKind],
        mode: CommandMode<C>,
    ) -> Result<&mut Self, CatalogError> {
        if name.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if self.commands.contains_key(name) {
            return Err(CatalogError::Duplicate(name.to_string()));
        }
        self.commands.insert(
            name.to_string(),
            CommandDescriptor {
                name: name.to_string(),
                arg_kinds: arg_kinds.to_vec(),
                mode,
            },
        );
        Ok(self)
    }

    /// Look up a command by name.
    pub fn get(&self, name: &str) -> Option<&CommandDescriptor<C>> {
        self.commands.get(name)
    }

    /// Reply shape of a deferred command.
    pub fn reply_shape(&self, name: &str) -> Option<ReplyShape> {
        match self.get(name)?.mode {
            CommandMode::Deferred(shape) => Some(shape),
            CommandMode::Sync(_) => None,
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True if no command is registered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_f64, FrameKind};

    struct Counter {
        hits: u32,
    }

    fn catalog() -> CommandCatalog<Counter> {
        let mut catalog = CommandCatalog::new();
        catalog
            .register_sync("hit", &[], |ctx: &mut Counter, _| {
                ctx.hits += 1;
                Ok(Reply::i32(ctx.hits as i32))
            })
            .unwrap()
            .register_sync("scale", &[ArgKind::F64], |_, args| {
                Ok(Reply::f64(args.f64(0)? * 2.0))
            })
            .unwrap()
            .register_deferred(
                "get_spot_amps",
                &[ArgKind::Text, ArgKind::Text, ArgKind::F64],
                ReplyShape::F64Array,
            )
            .unwrap();
        catalog
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut catalog = catalog();
        let err = catalog
            .register_deferred("hit", &[], ReplyShape::Text)
            .err()
            .unwrap();
        assert_eq!(err, CatalogError::Duplicate("hit".into()));
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let mut catalog: CommandCatalog<Counter> = CommandCatalog::new();
        assert_eq!(
            catalog.register_deferred("", &[], ReplyShape::Text).err(),
            Some(CatalogError::EmptyName)
        );
    }

    #[test]
    fn test_names_are_sorted() {
        assert_eq!(catalog().names(), vec!["get_spot_amps", "hit", "scale"]);
    }

    #[test]
    fn test_sync_handler_mutates_context() {
        let catalog = catalog();
        let mut ctx = Counter { hits: 0 };
        let descriptor = catalog.get("hit").unwrap();
        let CommandMode::Sync(handler) = descriptor.mode() else {
            panic!("hit should be sync");
        };
        handler(&mut ctx, &Args::default()).unwrap();
        let reply = handler(&mut ctx, &Args::default()).unwrap();
        assert_eq!(ctx.hits, 2);
        assert_eq!(reply.kinds(), vec![FrameKind::Binary]);
    }

    #[test]
    fn test_decode_args_in_declared_order() {
        let catalog = catalog();
        let descriptor = catalog.get("scale").unwrap();
        let args = descriptor
            .decode_args(&[0.05f64.to_le_bytes().to_vec(), b"ignored".to_vec()])
            .unwrap();
        assert_eq!(args.len(), 1);

        let CommandMode::Sync(handler) = descriptor.mode() else {
            panic!("scale should be sync");
        };
        let reply = handler(&mut Counter { hits: 0 }, &args).unwrap();
        assert_eq!(decode_f64(&reply.frames()[0].bytes).unwrap(), 0.1);
    }

    #[test]
    fn test_missing_argument_frame() {
        let catalog = catalog();
        let err = catalog
            .get("get_spot_amps")
            .unwrap()
            .decode_args(&[b"scan.mat".to_vec()])
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::MissingArg {
                index: 1,
                kind: ArgKind::Text
            }
        );
    }

    #[test]
    fn test_deferred_reply_shape() {
        let catalog = catalog();
        assert!(catalog.get("get_spot_amps").unwrap().is_deferred());
        assert_eq!(
            catalog.reply_shape("get_spot_amps"),
            Some(ReplyShape::F64Array)
        );
        assert_eq!(catalog.reply_shape("hit"), None);
        assert!(catalog.get("nope").is_none());
    }
}
