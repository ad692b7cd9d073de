//! Presentation layer with display targets.

/// Reusable widgets.
pub mod widgets;

pub use widgets::ImageView;
