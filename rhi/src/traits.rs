/// Native objects that can be destroyed explicitly.
///
/// With the `raii` feature enabled, `Drop` calls [`Destructible::destroy`] on its own.
pub trait Destructible {
    /// Destroy the native object
    fn destroy(&mut self);
}
