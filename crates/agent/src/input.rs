use cloudplay_protocol::InputEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcast;
use crate::capture::CaptureArea;

/// Browser wheel delta (pixels) that makes one scroll notch.
const PIXELS_PER_NOTCH: f64 = 30.0;

/// Input translated into screen terms, ready for injection.
#[derive(Debug, Clone, PartialEq)]
pub enum InputAction {
    /// Linux evdev keycode.
    Key { code: u16, pressed: bool },
    /// Absolute screen pixel.
    MoveTo { x: i32, y: i32 },
    /// X11 button number (1 left, 2 middle, 3 right).
    Button { button: u8, pressed: bool },
    /// Whole notches; X11 buttons 4/5 (vertical) and 6/7 (horizontal).
    Scroll { button: u8, notches: u32 },
}

/// Where translated input goes. Injection into the display is done by the
/// implementor.
pub trait InputSink: Send + Sync {
    fn inject(&mut self, action: InputAction) -> anyhow::Result<()>;
}

/// Sink that only logs, for hosts without an injector.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl InputSink for LoggingSink {
    fn inject(&mut self, action: InputAction) -> anyhow::Result<()> {
        debug!(?action, "Input");
        Ok(())
    }
}

/// Why the input loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// The player asked to leave.
    Exit,
    /// The data channel or capture-area feed went away.
    Closed,
    Cancelled,
}

/// Stateful mapping from player events to [`InputAction`]s.
#[derive(Debug, Default)]
pub struct InputTranslator {
    scroll_accum_x: f64,
    scroll_accum_y: f64,
}

impl InputTranslator {
    /// Browser: 0=left, 1=middle, 2=right. X11: 1=left, 2=middle, 3=right.
    fn map_button(button: u8) -> Option<u8> {
        match button {
            0 => Some(1),
            1 => Some(2),
            2 => Some(3),
            _ => None,
        }
    }

    /// Add `delta` notches and return the whole notches now due.
    fn accumulate_scroll(accum: &mut f64, delta: f64) -> i32 {
        *accum += delta;
        let discrete = *accum as i32;
        if discrete != 0 {
            *accum -= discrete as f64;
        }
        discrete
    }

    /// Translate one pointer/key event against `area`. Resize and exit are
    /// handled by the input loop and yield nothing here.
    pub fn translate(&mut self, event: &InputEvent, area: &CaptureArea) -> Vec<InputAction> {
        match *event {
            InputEvent::Key { c, d } => vec![InputAction::Key { code: c, pressed: d }],
            InputEvent::MouseMove { x, y } => {
                let (x, y) = area.to_absolute(x, y);
                vec![InputAction::MoveTo { x, y }]
            }
            InputEvent::Button { b, d } => match Self::map_button(b) {
                Some(button) => vec![InputAction::Button { button, pressed: d }],
                None => {
                    debug!(button = b, "Ignoring unknown mouse button");
                    Vec::new()
                }
            },
            InputEvent::Scroll { dx, dy } => {
                let mut actions = Vec::new();
                // Wheel deltas are positive downwards; button 4 scrolls up.
                let y = Self::accumulate_scroll(&mut self.scroll_accum_y, -dy / PIXELS_PER_NOTCH);
                if y != 0 {
                    let button = if y > 0 { 4 } else { 5 };
                    actions.push(InputAction::Scroll { button, notches: y.unsigned_abs() });
                }
                let x = Self::accumulate_scroll(&mut self.scroll_accum_x, dx / PIXELS_PER_NOTCH);
                if x != 0 {
                    let button = if x > 0 { 7 } else { 6 };
                    actions.push(InputAction::Scroll { button, notches: x.unsigned_abs() });
                }
                actions
            }
            InputEvent::Resize { .. } | InputEvent::Exit => Vec::new(),
        }
    }
}

/// Translate player input until the player exits or a feed closes.
///
/// Nothing is injected until the first capture area arrives on `areas`.
/// Resize requests are fitted for the encoder and published on `publish`,
/// which feeds `areas` back along with every other subscriber.
pub async fn run_input(
    mut events: mpsc::Receiver<InputEvent>,
    mut areas: mpsc::Receiver<CaptureArea>,
    publish: Broadcast<CaptureArea>,
    sink: &mut dyn InputSink,
    cancel: &CancellationToken,
) -> InputOutcome {
    let mut area = tokio::select! {
        _ = cancel.cancelled() => return InputOutcome::Cancelled,
        first = areas.recv() => match first {
            Some(area) => area,
            None => return InputOutcome::Closed,
        },
    };
    debug!(%area, "Input mapped to capture area");

    let mut translator = InputTranslator::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return InputOutcome::Cancelled,
            update = areas.recv() => match update {
                Some(next) => {
                    debug!(%next, "Capture area changed");
                    area = next;
                }
                None => return InputOutcome::Closed,
            },
            event = events.recv() => {
                let Some(event) = event else {
                    return InputOutcome::Closed;
                };
                match event {
                    InputEvent::Exit => {
                        info!("Player requested exit");
                        return InputOutcome::Exit;
                    }
                    InputEvent::Resize { w, h } => {
                        match CaptureArea::new(area.x, area.y, w, h).fit_for_h264() {
                            Ok(next) => {
                                info!(%next, "Player requested resize");
                                if publish.publish(next).await.is_err() {
                                    return InputOutcome::Closed;
                                }
                            }
                            Err(e) => warn!("Ignoring resize: {e}"),
                        }
                    }
                    other => {
                        for action in translator.translate(&other, &area) {
                            if let Err(e) = sink.inject(action) {
                                warn!("Input injection failed: {e}");
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Vec<InputAction>);

    impl InputSink for Recorder {
        fn inject(&mut self, action: InputAction) -> anyhow::Result<()> {
            self.0.push(action);
            Ok(())
        }
    }

    const AREA: CaptureArea = CaptureArea {
        x: 100,
        y: 50,
        width: 1280,
        height: 720,
    };

    #[test]
    fn button_mapping() {
        assert_eq!(InputTranslator::map_button(0), Some(1));
        assert_eq!(InputTranslator::map_button(1), Some(2));
        assert_eq!(InputTranslator::map_button(2), Some(3));
        assert_eq!(InputTranslator::map_button(3), None);
    }

    #[test]
    fn fractional_scroll_accumulates() {
        let mut accum = 0.0;
        assert_eq!(InputTranslator::accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(InputTranslator::accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(InputTranslator::accumulate_scroll(&mut accum, 0.3), 0);
        assert_eq!(InputTranslator::accumulate_scroll(&mut accum, 0.3), 1);
        assert!((accum - 0.2).abs() < 0.001);
        assert_eq!(InputTranslator::accumulate_scroll(&mut accum, -5.7), -5);
    }

    #[test]
    fn pointer_lands_in_capture_area() {
        let mut t = InputTranslator::default();
        let actions = t.translate(&InputEvent::MouseMove { x: 1.0, y: 0.0 }, &AREA);
        assert_eq!(actions, vec![InputAction::MoveTo { x: 100 + 1279, y: 50 }]);
    }

    #[test]
    fn wheel_down_is_button_five() {
        let mut t = InputTranslator::default();
        let actions = t.translate(&InputEvent::Scroll { dx: 0.0, dy: 60.0 }, &AREA);
        assert_eq!(actions, vec![InputAction::Scroll { button: 5, notches: 2 }]);
        let actions = t.translate(&InputEvent::Scroll { dx: -30.0, dy: 0.0 }, &AREA);
        assert_eq!(actions, vec![InputAction::Scroll { button: 6, notches: 1 }]);
    }

    #[tokio::test]
    async fn events_wait_for_first_area_then_translate() {
        let cancel = CancellationToken::new();
        let (areas_bc, _h) = Broadcast::start(cancel.clone());
        let areas = areas_bc.subscribe().await.unwrap();
        let (event_tx, event_rx) = mpsc::channel(8);

        event_tx.send(InputEvent::MouseMove { x: 0.0, y: 0.0 }).await.unwrap();
        event_tx.send(InputEvent::Key { c: 30, d: true }).await.unwrap();
        event_tx.send(InputEvent::Exit).await.unwrap();
        areas_bc.publish(AREA).await.unwrap();

        let mut sink = Recorder::default();
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            run_input(event_rx, areas, areas_bc.clone(), &mut sink, &cancel),
        )
        .await
        .unwrap();
        assert_eq!(outcome, InputOutcome::Exit);
        assert_eq!(
            sink.0,
            vec![
                InputAction::MoveTo { x: 100, y: 50 },
                InputAction::Key { code: 30, pressed: true },
            ]
        );
    }

    #[tokio::test]
    async fn resize_is_fitted_and_broadcast() {
        let cancel = CancellationToken::new();
        let (areas_bc, _h) = Broadcast::start(cancel.clone());
        let areas = areas_bc.subscribe().await.unwrap();
        let mut encoder = areas_bc.subscribe().await.unwrap();
        let (event_tx, event_rx) = mpsc::channel(8);

        areas_bc.publish(AREA).await.unwrap();
        assert_eq!(encoder.recv().await, Some(AREA));

        let mut sink = Recorder::default();
        let task = tokio::spawn({
            let areas_bc = areas_bc.clone();
            let cancel = cancel.clone();
            async move { run_input(event_rx, areas, areas_bc, &mut sink, &cancel).await }
        });

        event_tx.send(InputEvent::Resize { w: 801, h: 601 }).await.unwrap();
        let resized = tokio::time::timeout(Duration::from_secs(1), encoder.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resized, CaptureArea::new(100, 50, 800, 600));

        drop(event_tx);
        assert_eq!(task.await.unwrap(), InputOutcome::Closed);
    }

    #[tokio::test]
    async fn cancel_before_any_area() {
        let cancel = CancellationToken::new();
        let (areas_bc, _h) = Broadcast::<CaptureArea>::start(CancellationToken::new());
        let areas = areas_bc.subscribe().await.unwrap();
        let (_event_tx, event_rx) = mpsc::channel(1);
        cancel.cancel();
        let outcome = run_input(event_rx, areas, areas_bc, &mut LoggingSink, &cancel).await;
        assert_eq!(outcome, InputOutcome::Cancelled);
    }
}
