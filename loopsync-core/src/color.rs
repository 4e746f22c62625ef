//! Viewer color assignment

use std::collections::HashSet;

use rand::Rng;

/// Attempts before accepting a color that is already in use
const MAX_ATTEMPTS: usize = 32;

/// Draw a random `#rrggbb` color
pub fn random_color<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("#{:06x}", rng.gen_range(0..=0xFF_FFFFu32))
}

/// Pick a color not held by any connected session.
///
/// The color space has ~16.7M entries so a clash is already rare; the
/// retry loop only guards against it.
pub fn pick_color(in_use: &HashSet<&str>) -> String {
    pick_color_with(&mut rand::thread_rng(), in_use)
}

pub fn pick_color_with<R: Rng + ?Sized>(rng: &mut R, in_use: &HashSet<&str>) -> String {
    let mut color = random_color(rng);
    for _ in 1..MAX_ATTEMPTS {
        if !in_use.contains(color.as_str()) {
            break;
        }
        color = random_color(rng);
    }
    color
}
