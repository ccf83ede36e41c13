use crate::engine::{RenderSink, VisualHandle};
use crate::transport::ConnectionState;
use macroquad::prelude::*;
use shared::EntityId;
use std::collections::HashMap;

pub const SPRITE_SIZE: f32 = 32.0;

#[derive(Debug, Clone)]
struct Sprite {
    id: EntityId,
    x: f32,
    y: f32,
    rotation: f32,
}

#[derive(Debug, Clone)]
pub struct HudConfig {
    pub local: VisualHandle,
    pub state: ConnectionState,
    pub peer_count: usize,
}

/// Render sink that keeps sprite state and draws it with macroquad
pub struct Renderer {
    sprites: HashMap<VisualHandle, Sprite>,
    next_handle: u32,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            sprites: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn sprite_count(&self) -> usize {
        self.sprites.len()
    }

    pub fn render(&self, hud: HudConfig) {
        clear_background(Color::from_rgba(16, 153, 187, 255));

        for (handle, sprite) in &self.sprites {
            let is_local = *handle == hud.local;
            let color = if is_local {
                GREEN
            } else {
                Color::from_rgba(255, 68, 68, 255)
            };

            self.draw_sprite(sprite, color);
            self.draw_sprite_id(sprite);
        }

        self.draw_hud(&hud);
    }

    fn draw_sprite(&self, sprite: &Sprite, color: Color) {
        let half = SPRITE_SIZE / 2.0;
        draw_rectangle_ex(
            sprite.x,
            sprite.y,
            SPRITE_SIZE,
            SPRITE_SIZE,
            DrawRectangleParams {
                offset: vec2(0.5, 0.5),
                rotation: sprite.rotation,
                color,
            },
        );
        draw_rectangle_lines(
            sprite.x - half,
            sprite.y - half,
            SPRITE_SIZE,
            SPRITE_SIZE,
            1.0,
            WHITE,
        );
    }

    fn draw_sprite_id(&self, sprite: &Sprite) {
        let id_color = match sprite.id % 8 {
            0 => WHITE,
            1 => RED,
            2 => GREEN,
            3 => BLUE,
            4 => YELLOW,
            5 => MAGENTA,
            6 => Color::from_rgba(0, 255, 255, 255),
            _ => Color::from_rgba(136, 136, 136, 255),
        };

        let id_x = sprite.x - 2.0;
        let id_y = sprite.y - SPRITE_SIZE / 2.0 - 8.0;

        draw_rectangle(id_x, id_y, 4.0, 4.0, id_color);
    }

    fn draw_hud(&self, hud: &HudConfig) {
        let y_start = 10.0;

        let (connection_color, label) = match hud.state {
            ConnectionState::Open => (GREEN, "CON"),
            ConnectionState::Connecting => (YELLOW, "..."),
            ConnectionState::Closed => (RED, "OFF"),
        };
        draw_rectangle(10.0, y_start, 8.0, 8.0, connection_color);
        draw_text(label, 20.0, y_start + 8.0, 12.0, WHITE);

        let peer_y = y_start + 15.0;
        for i in 0..(hud.peer_count.min(8)) {
            draw_rectangle(
                10.0 + (i as f32) * 4.0,
                peer_y,
                3.0,
                3.0,
                Color::from_rgba(0, 170, 255, 255),
            );
        }
        let peer_text = format!("{} peers", hud.peer_count);
        draw_text(&peer_text, 45.0, peer_y + 3.0, 12.0, WHITE);
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSink for Renderer {
    fn create_visual(&mut self, id: EntityId) -> VisualHandle {
        self.next_handle += 1;
        let handle = VisualHandle(self.next_handle);
        self.sprites.insert(
            handle,
            Sprite {
                id,
                x: 0.0,
                y: 0.0,
                rotation: 0.0,
            },
        );
        handle
    }

    fn set_position(&mut self, handle: VisualHandle, x: f32, y: f32) {
        if let Some(sprite) = self.sprites.get_mut(&handle) {
            sprite.x = x;
            sprite.y = y;
        }
    }

    fn remove_visual(&mut self, handle: VisualHandle) {
        self.sprites.remove(&handle);
    }

    fn set_rotation(&mut self, handle: VisualHandle, radians: f32) {
        if let Some(sprite) = self.sprites.get_mut(&handle) {
            sprite.rotation = radians;
        }
    }
}
