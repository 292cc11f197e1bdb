use std::any::Any;

/// Trait for errors returned by plugin callbacks (syncer translations, hooks, initializers,
/// interceptors). This just sets up the trait bounds that are required, since the manager only
/// ever sees rather opaque boxed errors, and they need to be sent between tasks.
pub trait PluginError: std::error::Error + Send + Sync + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> PluginError for T
where
    T: std::error::Error + Send + Sync + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn PluginError>;

impl dyn PluginError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: PluginError>(&self) -> Option<&T> {
        let as_any = self.as_any();
        as_any.downcast_ref::<T>()
    }

    /// convenience function for checking whether the error is of the given concrete type.
    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return
    /// `Some`.
    pub fn is_type<T: PluginError>(&self) -> bool {
        let as_any = self.as_any();
        as_any.is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: PluginError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

/// A plain message error, for callbacks that have nothing more structured to report.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageError(pub String);

impl MessageError {
    pub fn new(message: impl Into<String>) -> Error {
        Box::new(MessageError(message.into()))
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}
impl std::error::Error for MessageError {}
