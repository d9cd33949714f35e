use serde::{Deserialize, Serialize};
use shared::TimeRange;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_ZOOM_FACTOR: f64 = 1.4;

// ===== STATE =====

/// Channel identifier as used by selection: an index or a channel name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ChannelId {
    Index(i64),
    Name(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Index(index) => write!(f, "{}", index),
            ChannelId::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for ChannelId {
    fn from(index: i64) -> Self {
        ChannelId::Index(index)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        ChannelId::Name(name.to_string())
    }
}

/// Snapshot of a view's time navigation. Times are seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NavigationState {
    pub series_start: Option<f64>,
    pub series_end: Option<f64>,
    pub visible_start: Option<f64>,
    pub visible_end: Option<f64>,
    pub focus_time: Option<f64>,
    pub focus_interval: Option<(f64, f64)>,
    pub selected_channel_ids: Option<Vec<ChannelId>>,
}

impl NavigationState {
    pub fn series_range(&self) -> Option<TimeRange> {
        Some(TimeRange::new(self.series_start?, self.series_end?))
    }

    pub fn visible_range(&self) -> Option<TimeRange> {
        Some(TimeRange::new(self.visible_start?, self.visible_end?))
    }

    /// Ordering invariants of the bounds; used for diagnostics only.
    pub fn is_valid(&self) -> bool {
        let ordered = |start: Option<f64>, end: Option<f64>| match (start, end) {
            (Some(start), Some(end)) => end >= start,
            (None, None) => true,
            _ => false,
        };
        ordered(self.series_start, self.series_end)
            && ordered(self.visible_start, self.visible_end)
            && self
                .focus_interval
                .is_none_or(|(start, end)| end >= start)
    }

    fn bounds(&self) -> Option<Bounds> {
        Some(Bounds {
            series_start: self.series_start?,
            series_end: self.series_end?,
            visible_start: self.visible_start?,
            visible_end: self.visible_end?,
        })
    }

    fn with_visible(&self, start: f64, end: f64) -> NavigationState {
        NavigationState {
            visible_start: Some(start),
            visible_end: Some(end),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    series_start: f64,
    series_end: f64,
    visible_start: f64,
    visible_end: f64,
}

// ===== ACTIONS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanDirection {
    Forward,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PanAmount {
    /// Percent of the visible window width.
    Percent(f64),
    Seconds(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoomDirection {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NavigationAction {
    Initialize {
        start: f64,
        end: f64,
    },
    Pan {
        direction: PanDirection,
        amount: PanAmount,
    },
    Zoom {
        direction: ZoomDirection,
        factor: Option<f64>,
        anchor: Option<f64>,
    },
    SetVisibleRange {
        start: f64,
        end: f64,
    },
    SetFocusTime {
        time: f64,
        extend_selection: bool,
        auto_scroll: bool,
    },
    SetFocusInterval {
        interval: (f64, f64),
        auto_scroll: bool,
    },
    SetSelectedChannels(Vec<ChannelId>),
}

// ===== TRANSITIONS =====

/// Applies `action` to `state`.
///
/// Transitions that change nothing return the same `Arc`, so callers can skip
/// downstream work with `Arc::ptr_eq`.
pub fn reduce(state: &Arc<NavigationState>, action: NavigationAction) -> Arc<NavigationState> {
    match action {
        NavigationAction::Initialize { start, end } => initialize(state, start, end),
        NavigationAction::Pan { direction, amount } => pan(state, direction, amount),
        NavigationAction::Zoom {
            direction,
            factor,
            anchor,
        } => zoom(state, direction, factor, anchor),
        NavigationAction::SetVisibleRange { start, end } => {
            if state.visible_start == Some(start) && state.visible_end == Some(end) {
                return Arc::clone(state);
            }
            Arc::new(state.with_visible(start, end))
        }
        NavigationAction::SetFocusTime {
            time,
            extend_selection,
            auto_scroll,
        } => set_focus_time(state, time, extend_selection, auto_scroll),
        NavigationAction::SetFocusInterval {
            interval,
            auto_scroll,
        } => set_focus_interval(state, interval, auto_scroll),
        NavigationAction::SetSelectedChannels(ids) => set_selected_channels(state, ids),
    }
}

fn initialize(state: &Arc<NavigationState>, start: f64, end: f64) -> Arc<NavigationState> {
    let series_start = state.series_start.map_or(start, |current| current.min(start));
    let series_end = state.series_end.map_or(end, |current| current.max(end));

    let next = NavigationState {
        series_start: Some(series_start),
        series_end: Some(series_end),
        visible_start: state.visible_start.or(Some(series_start)),
        visible_end: state.visible_end.or(Some(series_end)),
        ..(**state).clone()
    };
    if !next.is_valid() {
        log::warn!("Initialization produced an invalid navigation state: {:?}", next);
    }
    if next == **state {
        return Arc::clone(state);
    }
    Arc::new(next)
}

fn pan(
    state: &Arc<NavigationState>,
    direction: PanDirection,
    amount: PanAmount,
) -> Arc<NavigationState> {
    let Some(bounds) = state.bounds() else {
        log::warn!("Ignoring pan before the time range is initialized");
        return Arc::clone(state);
    };

    let width = bounds.visible_end - bounds.visible_start;
    let magnitude = match amount {
        PanAmount::Percent(percent) => percent / 100.0 * width,
        PanAmount::Seconds(seconds) => seconds,
    };
    let displacement = match direction {
        PanDirection::Forward => magnitude,
        PanDirection::Back => -magnitude,
    };
    if displacement == 0.0 || !displacement.is_finite() {
        return Arc::clone(state);
    }

    let (new_start, new_end) = if displacement > 0.0 {
        let new_end = (bounds.visible_end + displacement).min(bounds.series_end);
        ((new_end - width).max(bounds.series_start), new_end)
    } else {
        let new_start = (bounds.visible_start + displacement).max(bounds.series_start);
        (new_start, (new_start + width).min(bounds.series_end))
    };

    if new_start == bounds.visible_start && new_end == bounds.visible_end {
        return Arc::clone(state);
    }
    Arc::new(state.with_visible(new_start, new_end))
}

fn zoom(
    state: &Arc<NavigationState>,
    direction: ZoomDirection,
    factor: Option<f64>,
    anchor: Option<f64>,
) -> Arc<NavigationState> {
    let Some(bounds) = state.bounds() else {
        log::warn!("Ignoring zoom before the time range is initialized");
        return Arc::clone(state);
    };

    let factor = match factor {
        None => DEFAULT_ZOOM_FACTOR,
        Some(factor) if factor.is_finite() && factor >= 1.0 => factor,
        Some(factor) => {
            log::warn!("Zoom factor {} is invalid, using {}", factor, DEFAULT_ZOOM_FACTOR);
            DEFAULT_ZOOM_FACTOR
        }
    };

    let total_width = bounds.series_end - bounds.series_start;
    let current_width = bounds.visible_end - bounds.visible_start;
    if current_width <= 0.0 {
        return Arc::clone(state);
    }
    if direction == ZoomDirection::Out && current_width == total_width {
        return Arc::clone(state);
    }

    let multiplier = match direction {
        ZoomDirection::In => 1.0 / factor,
        ZoomDirection::Out => factor,
    };
    let new_width = (current_width * multiplier).min(total_width);

    let (new_start, new_end) = if new_width >= total_width {
        (bounds.series_start, bounds.series_end)
    } else {
        let anchor = anchor
            .or(state.focus_time)
            .unwrap_or(bounds.visible_start + current_width / 2.0);
        let anchor_fraction = (anchor - bounds.visible_start) / current_width;
        let new_start = (anchor - anchor_fraction * new_width).max(bounds.series_start);
        let new_end = (new_start + new_width).min(bounds.series_end);
        // end clamping must not shrink the window
        (new_end - new_width, new_end)
    };

    if new_start == bounds.visible_start && new_end == bounds.visible_end {
        return Arc::clone(state);
    }
    Arc::new(state.with_visible(new_start, new_end))
}

fn set_focus_time(
    state: &Arc<NavigationState>,
    time: f64,
    extend_selection: bool,
    auto_scroll: bool,
) -> Arc<NavigationState> {
    let mut next = match state.focus_time {
        Some(previous) if extend_selection => NavigationState {
            focus_interval: Some((previous.min(time), previous.max(time))),
            ..(**state).clone()
        },
        _ => NavigationState {
            focus_time: Some(time),
            focus_interval: None,
            ..(**state).clone()
        },
    };

    if auto_scroll && let Some((start, end)) = scroll_into_view(&next, time) {
        next.visible_start = Some(start);
        next.visible_end = Some(end);
    }

    if next == **state {
        return Arc::clone(state);
    }
    Arc::new(next)
}

fn set_focus_interval(
    state: &Arc<NavigationState>,
    interval: (f64, f64),
    auto_scroll: bool,
) -> Arc<NavigationState> {
    let mut next = NavigationState {
        focus_interval: Some(interval),
        ..(**state).clone()
    };
    if auto_scroll
        && let Some((start, end)) = scroll_into_view(&next, (interval.0 + interval.1) / 2.0)
    {
        next.visible_start = Some(start);
        next.visible_end = Some(end);
    }

    if !next.is_valid() {
        log::warn!("Rejecting focus interval {:?}", interval);
        return Arc::clone(state);
    }
    if next == **state {
        return Arc::clone(state);
    }
    Arc::new(next)
}

fn set_selected_channels(
    state: &Arc<NavigationState>,
    ids: Vec<ChannelId>,
) -> Arc<NavigationState> {
    // no selection counts as an empty one
    let current = state.selected_channel_ids.as_deref().unwrap_or(&[]);
    if current.len() == ids.len() && ids.iter().all(|id| current.contains(id)) {
        return Arc::clone(state);
    }
    Arc::new(NavigationState {
        selected_channel_ids: Some(ids),
        ..(**state).clone()
    })
}

/// Visible window recentered on `target` when it is out of view, translated back
/// inside the series bounds without changing its width.
fn scroll_into_view(state: &NavigationState, target: f64) -> Option<(f64, f64)> {
    let (visible_start, visible_end) = (state.visible_start?, state.visible_end?);
    if target >= visible_start && target <= visible_end {
        return None;
    }

    let width = visible_end - visible_start;
    let mut start = target - width / 2.0;
    let mut end = start + width;
    if let (Some(series_start), Some(series_end)) = (state.series_start, state.series_end) {
        if end > series_end {
            start -= end - series_end;
            end = series_end;
        }
        if start < series_start {
            end += series_start - start;
            start = series_start;
        }
    }
    Some((start, end))
}
