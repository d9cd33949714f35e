use crate::navigation::{
    ChannelId, NavigationAction, NavigationState, PanAmount, PanDirection, ZoomDirection, reduce,
};
use shared::NavigationSection;
use std::sync::Arc;
use tokio::sync::watch;

/// Owns the navigation state of one view and publishes every change.
///
/// Subscribers only wake up when a dispatched action actually produced a new state.
pub struct TimeWindowController {
    state: watch::Sender<Arc<NavigationState>>,
    settings: NavigationSection,
}

impl TimeWindowController {
    pub fn new(settings: NavigationSection) -> Self {
        let (state, _) = watch::channel(Arc::new(NavigationState::default()));
        Self { state, settings }
    }

    /// Applies `action`; returns `true` when the state changed.
    pub fn dispatch(&self, action: NavigationAction) -> bool {
        self.state.send_if_modified(|current| {
            let next = reduce(current, action);
            if Arc::ptr_eq(current, &next) {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn state(&self) -> Arc<NavigationState> {
        Arc::clone(&self.state.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<NavigationState>> {
        self.state.subscribe()
    }

    pub fn initialize(&self, start: f64, end: f64) -> bool {
        self.dispatch(NavigationAction::Initialize { start, end })
    }

    /// Pans by the configured percentage of the visible window.
    pub fn pan(&self, direction: PanDirection) -> bool {
        self.pan_by(direction, PanAmount::Percent(self.settings.pan_percent))
    }

    pub fn pan_by(&self, direction: PanDirection, amount: PanAmount) -> bool {
        self.dispatch(NavigationAction::Pan { direction, amount })
    }

    /// Zooms by the configured factor around `anchor`, the focus time or the window center.
    pub fn zoom(&self, direction: ZoomDirection, anchor: Option<f64>) -> bool {
        self.dispatch(NavigationAction::Zoom {
            direction,
            factor: Some(self.settings.zoom_factor),
            anchor,
        })
    }

    pub fn set_visible_range(&self, start: f64, end: f64) -> bool {
        self.dispatch(NavigationAction::SetVisibleRange { start, end })
    }

    pub fn set_focus_time(&self, time: f64, extend_selection: bool, auto_scroll: bool) -> bool {
        self.dispatch(NavigationAction::SetFocusTime {
            time,
            extend_selection,
            auto_scroll,
        })
    }

    pub fn set_focus_interval(&self, interval: (f64, f64), auto_scroll: bool) -> bool {
        self.dispatch(NavigationAction::SetFocusInterval {
            interval,
            auto_scroll,
        })
    }

    pub fn set_selected_channels(&self, ids: Vec<ChannelId>) -> bool {
        self.dispatch(NavigationAction::SetSelectedChannels(ids))
    }
}

impl Default for TimeWindowController {
    fn default() -> Self {
        Self::new(NavigationSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_only_real_changes() {
        let controller = TimeWindowController::default();
        let mut updates = controller.subscribe();

        assert!(controller.initialize(0.0, 100.0));
        assert!(updates.has_changed().unwrap());
        updates.borrow_and_update();

        assert!(!controller.zoom(ZoomDirection::Out, None));
        assert!(!updates.has_changed().unwrap());

        assert!(controller.zoom(ZoomDirection::In, Some(0.0)));
        updates.changed().await.unwrap();
        let state = updates.borrow_and_update().clone();
        let range = state.visible_range().unwrap();
        assert_eq!(range.start, 0.0);
        assert!((range.duration() - 100.0 / 1.4).abs() < 1e-9);
    }

    #[test]
    fn test_pan_uses_configured_percentage() {
        let controller = TimeWindowController::new(NavigationSection {
            zoom_factor: 2.0,
            pan_percent: 25.0,
        });
        controller.initialize(0.0, 100.0);
        controller.set_visible_range(40.0, 60.0);

        assert!(controller.pan(PanDirection::Forward));
        let range = controller.state().visible_range().unwrap();
        assert_eq!((range.start, range.end), (45.0, 65.0));

        assert!(controller.zoom(ZoomDirection::In, Some(45.0)));
        let range = controller.state().visible_range().unwrap();
        assert_eq!((range.start, range.end), (45.0, 55.0));
    }

    #[test]
    fn test_same_selection_does_not_notify() {
        let controller = TimeWindowController::default();
        let before = controller.state();
        assert!(controller.set_selected_channels(vec![ChannelId::Index(0), ChannelId::Index(2)]));
        assert!(!Arc::ptr_eq(&before, &controller.state()));

        let selected = controller.state();
        assert!(!controller.set_selected_channels(vec![ChannelId::Index(2), ChannelId::Index(0)]));
        assert!(Arc::ptr_eq(&selected, &controller.state()));
    }
}
