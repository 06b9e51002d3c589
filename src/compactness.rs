//! District compactness scores.
//!
//! Both scores are computed on a spherical-mercator projection, which is
//! accurate enough at typical district sizes. Failures (empty or
//! unprojectable geometry) yield None rather than an error; the null score
//! is reported as-is.

use std::collections::BTreeMap;

use geo::{Area, MultiPolygon};

const EARTH_RADIUS: f64 = 6_378_137.0;

/// All compactness scores for one district geometry.
pub fn scores(geometry: &MultiPolygon<f64>) -> BTreeMap<String, Option<f64>> {
    BTreeMap::from([
        ("Reock".to_string(), reock(geometry)),
        ("Polsby-Popper".to_string(), polsby_popper(geometry)),
    ])
}

/// Area ratio of the district to its minimum bounding circle.
pub fn reock(geometry: &MultiPolygon<f64>) -> Option<f64> {
    let projected = project(geometry)?;
    let area = projected.unsigned_area();
    if area <= 0.0 {
        return None;
    }

    let points: Vec<(f64, f64)> = projected.0.iter()
        .flat_map(|polygon| {
            std::iter::once(polygon.exterior()).chain(polygon.interiors())
        })
        .flat_map(|ring| ring.0.iter().map(|c| (c.x, c.y)))
        .collect();

    let (_, _, radius) = enclosing_circle(&points)?;
    if radius <= 0.0 {
        return None;
    }
    Some(area / (std::f64::consts::PI * radius * radius))
}

/// 4π·area / perimeter².
pub fn polsby_popper(geometry: &MultiPolygon<f64>) -> Option<f64> {
    let projected = project(geometry)?;
    let area = projected.unsigned_area();
    let perimeter: f64 = projected.0.iter()
        .flat_map(|polygon| {
            std::iter::once(polygon.exterior()).chain(polygon.interiors())
        })
        .map(|ring| {
            ring.lines().map(|line| {
                let dx = line.end.x - line.start.x;
                let dy = line.end.y - line.start.y;
                dx.hypot(dy)
            }).sum::<f64>()
        })
        .sum();

    if area <= 0.0 || perimeter <= 0.0 {
        return None;
    }
    Some(4.0 * std::f64::consts::PI * area / (perimeter * perimeter))
}

/// Latitude bound of the web-mercator domain.
const MAX_LATITUDE: f64 = 85.06;

/// Forward spherical-mercator projection, EPSG:4326 → EPSG:3857.
fn project(geometry: &MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    use geo::{CoordsIter, MapCoords};

    if geometry.0.is_empty() {
        return None;
    }

    let projected = geometry.map_coords(|c| {
        let y = if c.y.abs() > MAX_LATITUDE {
            f64::NAN
        } else {
            EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + c.y.to_radians() / 2.0).tan().ln()
        };
        geo::coord! { x: EARTH_RADIUS * c.x.to_radians(), y: y }
    });

    let finite = projected.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite());
    finite.then_some(projected)
}

/// Smallest enclosing circle over a point set (Welzl's move-to-front form).
/// Returns (cx, cy, radius).
fn enclosing_circle(points: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    let mut circle: Option<(f64, f64, f64)> = None;

    for (i, &p) in points.iter().enumerate() {
        if circle.is_some_and(|c| in_circle(c, p)) {
            continue;
        }
        circle = Some(circle_one_point(&points[..=i], p));
    }

    circle
}

fn circle_one_point(points: &[(f64, f64)], p: (f64, f64)) -> (f64, f64, f64) {
    let mut circle = (p.0, p.1, 0.0);
    for (i, &q) in points.iter().enumerate() {
        if in_circle(circle, q) {
            continue;
        }
        circle = if circle.2 == 0.0 {
            diameter_circle(p, q)
        } else {
            circle_two_points(&points[..=i], p, q)
        };
    }
    circle
}

fn circle_two_points(points: &[(f64, f64)], p: (f64, f64), q: (f64, f64)) -> (f64, f64, f64) {
    let base = diameter_circle(p, q);
    let (mut left, mut right): (Option<(f64, f64, f64)>, Option<(f64, f64, f64)>) = (None, None);

    let (px, py) = p;
    let (qx, qy) = q;
    for &r in points {
        if in_circle(base, r) {
            continue;
        }
        let side = cross(qx - px, qy - py, r.0 - px, r.1 - py);
        let Some(candidate) = circumcircle(p, q, r) else { continue };
        let cand_side = cross(qx - px, qy - py, candidate.0 - px, candidate.1 - py);
        if side > 0.0 && left.is_none_or(|c| cand_side > cross(qx - px, qy - py, c.0 - px, c.1 - py)) {
            left = Some(candidate);
        } else if side < 0.0 && right.is_none_or(|c| cand_side < cross(qx - px, qy - py, c.0 - px, c.1 - py)) {
            right = Some(candidate);
        }
    }

    match (left, right) {
        (None, None) => base,
        (Some(l), None) => l,
        (None, Some(r)) => r,
        (Some(l), Some(r)) => if l.2 <= r.2 { l } else { r },
    }
}

fn diameter_circle(a: (f64, f64), b: (f64, f64)) -> (f64, f64, f64) {
    let cx = (a.0 + b.0) / 2.0;
    let cy = (a.1 + b.1) / 2.0;
    let radius = ((a.0 - cx).hypot(a.1 - cy)).max((b.0 - cx).hypot(b.1 - cy));
    (cx, cy, radius)
}

fn circumcircle(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Option<(f64, f64, f64)> {
    let ox = (a.0.min(b.0).min(c.0) + a.0.max(b.0).max(c.0)) / 2.0;
    let oy = (a.1.min(b.1).min(c.1) + a.1.max(b.1).max(c.1)) / 2.0;
    let (ax, ay) = (a.0 - ox, a.1 - oy);
    let (bx, by) = (b.0 - ox, b.1 - oy);
    let (cx, cy) = (c.0 - ox, c.1 - oy);
    let d = 2.0 * (ax * (by - cy) + bx * (cy - ay) + cx * (ay - by));
    if d == 0.0 {
        return None;
    }
    let x = ox + ((ax * ax + ay * ay) * (by - cy)
        + (bx * bx + by * by) * (cy - ay)
        + (cx * cx + cy * cy) * (ay - by)) / d;
    let y = oy + ((ax * ax + ay * ay) * (cx - bx)
        + (bx * bx + by * by) * (ax - cx)
        + (cx * cx + cy * cy) * (bx - ax)) / d;
    let radius = [a, b, c].iter()
        .map(|p| (p.0 - x).hypot(p.1 - y))
        .fold(0.0_f64, f64::max);
    Some((x, y, radius))
}

#[inline]
fn cross(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    ax * by - ay * bx
}

#[inline]
fn in_circle(circle: (f64, f64, f64), p: (f64, f64)) -> bool {
    const EPSILON: f64 = 1.0 + 1e-14;
    (p.0 - circle.0).hypot(p.1 - circle.1) <= circle.2 * EPSILON
}
