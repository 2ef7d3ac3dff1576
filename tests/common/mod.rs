#![allow(dead_code)]

pub fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

pub fn vec_approx_eq(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| approx_eq(*x, *y))
}
