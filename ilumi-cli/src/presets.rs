//! Named white profiles and built-in effects

use ilumi_proto::{Color, Pattern, PatternFrame, REPEAT_FOREVER, SceneId, ValueOutOfRange};

/// Slot the built-in effects are uploaded into
pub const EFFECT_SCENE: SceneId = 4;

pub const CANDLE_PROFILE: &str = "candle_light";

/// (name, r, g, b, w)
pub const WHITES: &[(&str, u8, u8, u8, u8)] = &[
    ("cool_white", 0, 68, 111, 255),
    ("daylight", 0, 69, 83, 255),
    ("incandescent", 0, 32, 33, 255),
    ("natural_white", 22, 0, 17, 255),
    ("early_morning", 83, 75, 0, 255),
    ("sunrise", 107, 0, 0, 255),
    ("sunlight", 107, 0, 0, 255),
    ("edison_bulb", 175, 180, 0, 63),
    ("bug_lighting", 255, 30, 0, 0),
    ("sleep", 190, 0, 0, 0),
    ("relax", 190, 0, 63, 0),
    ("beauty", 0, 0, 255, 0),
    ("think", 75, 0, 255, 0),
    ("focus", 77, 77, 255, 0),
    ("energize", 0, 153, 255, 0),
    ("witches_brew", 255, 0, 0, 0),
    (CANDLE_PROFILE, 255, 190, 0, 29),
    ("core_breach", 255, 150, 0, 100),
];

/// A white profile at `brightness` (0-255)
pub fn white(name: &str, brightness: i64) -> Option<Result<Color, ValueOutOfRange>> {
    let &(_, r, g, b, w) = WHITES.iter().find(|(n, ..)| *n == name)?;
    Some(Color::new(r.into(), g.into(), b.into(), w.into(), brightness))
}

pub fn white_names() -> Vec<&'static str> {
    WHITES.iter().map(|(n, ..)| *n).collect()
}

pub const EFFECTS: &[&str] = &["rainbow", "police", "breathe", "fire"];

/// Normalise user input: lowercase, spaces to underscores
pub fn normalise(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

fn frame(r: u8, g: u8, b: u8, w: u8, sustain_ms: u32, transit_ms: u32) -> PatternFrame {
    PatternFrame::new(Color::rgbw(r, g, b, w, 255), sustain_ms, transit_ms)
}

/// Looping pattern for a built-in effect
pub fn effect(name: &str) -> Option<Result<Pattern, ValueOutOfRange>> {
    let frames = match name {
        "rainbow" => (0..12)
            .map(|i| {
                let (r, g, b) = hsv_to_rgb(i as f32 / 12.0);
                frame(r, g, b, 0, 200, 800)
            })
            .collect(),
        "police" => vec![
            frame(255, 0, 0, 0, 150, 0),
            frame(0, 0, 0, 0, 100, 0),
            frame(0, 0, 255, 0, 150, 0),
            frame(0, 0, 0, 0, 100, 0),
        ],
        "breathe" => vec![frame(0, 0, 0, 255, 300, 2000), frame(0, 0, 0, 20, 300, 2000)],
        "fire" => vec![
            frame(255, 80, 0, 0, 120, 80),
            frame(255, 40, 0, 10, 90, 60),
            frame(230, 100, 0, 0, 150, 100),
            frame(200, 30, 0, 0, 80, 70),
        ],
        _ => return None,
    };
    Some(Pattern::new(EFFECT_SCENE, frames, REPEAT_FOREVER).map(|p| p.start_now(true)))
}

/// Fully saturated color for `hue` in 0.0..1.0
pub fn hsv_to_rgb(hue: f32) -> (u8, u8, u8) {
    let h = hue.rem_euclid(1.0) * 6.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let scale = |v: f32| (v * 255.0).round() as u8;
    (scale(r), scale(g), scale(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whites_lookup() {
        assert_eq!(white("daylight", 255), Some(Ok(Color::rgbw(0, 69, 83, 255, 255))));
        assert_eq!(
            white(&normalise("Natural White"), 255),
            Some(Ok(Color::rgbw(22, 0, 17, 255, 255)))
        );
        assert!(white("ultraviolet", 255).is_none());
        assert!(white_names().contains(&CANDLE_PROFILE));
    }

    #[test]
    fn whites_take_a_brightness() {
        let dimmed = white("sleep", 40).unwrap().unwrap();
        assert_eq!(dimmed, Color::rgbw(190, 0, 0, 0, 40));
        assert!(white("sleep", 256).unwrap().is_err());
        assert!(white("sleep", -1).unwrap().is_err());
    }

    #[test]
    fn every_effect_builds() {
        for name in EFFECTS {
            let pattern = effect(name).unwrap().unwrap();
            assert_eq!(pattern.scene(), EFFECT_SCENE);
            assert_eq!(pattern.repeat(), REPEAT_FOREVER);
            assert!(pattern.starts_now());
        }
        assert!(effect("disco").is_none());
    }

    #[test]
    fn hue_wheel() {
        assert_eq!(hsv_to_rgb(0.0), (255, 0, 0));
        assert_eq!(hsv_to_rgb(1.0 / 3.0), (0, 255, 0));
        assert_eq!(hsv_to_rgb(2.0 / 3.0), (0, 0, 255));
        assert_eq!(hsv_to_rgb(1.0), (255, 0, 0));
    }
}
