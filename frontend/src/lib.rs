//! Navigation side of the engine: the time window state machine and the
//! views that turn it into loaded samples.

pub mod controller;
pub mod navigation;
pub mod view;

pub use controller::TimeWindowController;
pub use navigation::{
    ChannelId, DEFAULT_ZOOM_FACTOR, NavigationAction, NavigationState, PanAmount, PanDirection,
    ZoomDirection, reduce,
};
pub use view::{SeriesView, VisibleLoad, VisibleWindow};
