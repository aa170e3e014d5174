//! Feedback server.
//!
//! Everything except `id` is answered by an external program through the
//! deferred reply mailbox: the worker parks the request, the completer reads
//! it (`peek_pending`, or the request record of a file mailbox) and supplies
//! the value with `complete`.

use crate::catalog::{CatalogError, CommandCatalog};
use crate::protocol::{ArgKind, Reply, ReplyShape};

/// State owned by the feedback worker.
#[derive(Debug, Clone)]
pub struct FeedbackContext {
    name: String,
}

impl FeedbackContext {
    /// Context for a server called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// Commands of the feedback server.
pub fn catalog() -> Result<CommandCatalog<FeedbackContext>, CatalogError> {
    let mut catalog = CommandCatalog::new();
    catalog
        .register_sync("id", &[], |ctx: &mut FeedbackContext, _| {
            Ok(Reply::text(format!("{}: feedback server", ctx.name)))
        })?
        // scan file, scan name, number of averages
        .register_deferred(
            "get_spot_amps",
            &[ArgKind::Text, ArgKind::Text, ArgKind::F64],
            ReplyShape::F64Array,
        )?
        .register_deferred("get_image", &[], ReplyShape::Binary)?
        .register_deferred("get_exposure", &[], ReplyShape::F64)?
        .register_deferred("set_exposure", &[ArgKind::F64], ReplyShape::Text)?;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::tests::{invoke, text};

    #[test]
    fn test_only_id_is_inline() {
        let catalog = catalog().unwrap();
        assert_eq!(
            catalog.names(),
            vec!["get_exposure", "get_image", "get_spot_amps", "id", "set_exposure"]
        );
        for name in ["get_exposure", "get_image", "get_spot_amps", "set_exposure"] {
            assert!(catalog.get(name).unwrap().is_deferred(), "{name}");
        }
        let mut ctx = FeedbackContext::new("fb");
        let reply = invoke(&catalog, &mut ctx, "id", &[]).unwrap();
        assert_eq!(text(&reply), "fb: feedback server");
    }

    #[test]
    fn test_reply_shapes() {
        let catalog = catalog().unwrap();
        assert_eq!(catalog.reply_shape("get_spot_amps"), Some(ReplyShape::F64Array));
        assert_eq!(catalog.reply_shape("get_image"), Some(ReplyShape::Binary));
        assert_eq!(catalog.reply_shape("get_exposure"), Some(ReplyShape::F64));
        assert_eq!(catalog.reply_shape("set_exposure"), Some(ReplyShape::Text));
        assert_eq!(catalog.reply_shape("id"), None);
    }
}
