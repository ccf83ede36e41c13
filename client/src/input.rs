//! Directional input intent and the keyboard source that produces it

use macroquad::prelude::*;

/// Directional keys held during one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputIntent {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

impl InputIntent {
    pub fn is_moving(&self) -> bool {
        self.up || self.down || self.left || self.right
    }

    /// Displacement for one frame at `speed` units per second
    ///
    /// Each held axis moves by the full speed, so diagonals travel faster
    /// than a single axis. Opposing keys cancel out.
    pub fn displacement(&self, speed: f32, dt: f32) -> (f32, f32) {
        let step = speed * dt;
        let mut dx = 0.0;
        let mut dy = 0.0;

        if self.left {
            dx -= step;
        }
        if self.up {
            dy -= step;
        }
        if self.right {
            dx += step;
        }
        if self.down {
            dy += step;
        }

        (dx, dy)
    }
}

/// Anything that can be asked for the current input intent once per frame
pub trait InputSource {
    fn intent(&self) -> InputIntent;
}

/// Arrow keys and WASD from the macroquad window
#[derive(Debug, Default)]
pub struct KeyboardInput;

impl KeyboardInput {
    pub fn new() -> Self {
        Self
    }

    /// Escape pressed this frame
    pub fn quit_requested(&self) -> bool {
        is_key_pressed(KeyCode::Escape)
    }
}

impl InputSource for KeyboardInput {
    fn intent(&self) -> InputIntent {
        InputIntent {
            up: is_key_down(KeyCode::Up) || is_key_down(KeyCode::W),
            down: is_key_down(KeyCode::Down) || is_key_down(KeyCode::S),
            left: is_key_down(KeyCode::Left) || is_key_down(KeyCode::A),
            right: is_key_down(KeyCode::Right) || is_key_down(KeyCode::D),
        }
    }
}
