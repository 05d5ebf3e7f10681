//! Render target abstraction.
//!
//! The platform layer owns the actual window/texture; the mirror only needs
//! a handle to hand to the decoder and a way to give it back.

use crate::error::AdbError;

pub trait RenderSurface: Send + Sync {
    /// Whatever the decoder renders into (a native window, a texture...).
    type Target: Send;

    /// Obtain the drawable target. Called once per mirror session.
    fn acquire(&self) -> Result<Self::Target, AdbError>;

    /// Return the target. Called exactly once after a successful acquire.
    fn release(&self);

    /// The on-screen view changed size.
    fn on_resize(&self, _width: u32, _height: u32) {}
}
