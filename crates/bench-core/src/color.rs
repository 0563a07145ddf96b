/// Returns `n` RGB triples with evenly spaced hues, alternating brightness so
/// neighbours in a sorted model list stay distinguishable.
pub fn distinct_colors(n: usize) -> Vec<[f64; 3]> {
    (0..n)
        .map(|i| {
            let hue = i as f64 / n as f64;
            let value = if i % 2 == 0 { 0.9 } else { 0.65 };
            hsv_to_rgb(hue, 0.75, value)
        })
        .collect()
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [f64; 3] {
    let h6 = (h * 6.0) % 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u8 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}
