//! Polygon proximity used to decide which regions belong together.

use geo::{Area, BooleanOps, BoundingRect, Coord, Line, LineString, MultiPolygon, Rect};

/// Closest distance between two outlines.
///
/// Zero when the outlines share interior area. Otherwise the minimum,
/// over every pair of boundary edges (closing edges and hole rings
/// included), of [`segment_distance`]. Returns `f64::INFINITY` if either
/// outline has no edges.
#[must_use]
pub fn closest_distance(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> f64 {
    if overlaps(a, b) {
        return 0.0;
    }

    let b_edges: Vec<Line<f64>> = edges(b).collect();
    edges(a)
        .flat_map(|ea| b_edges.iter().map(move |eb| segment_distance(ea, *eb)))
        .fold(f64::INFINITY, f64::min)
}

/// Distance between two line segments.
///
/// When the segments cross within both parametric ranges, the result is
/// the distance from `p`'s start to the crossing point. Otherwise, and
/// whenever the pair is parallel or degenerate, it is the smallest of
/// the four endpoint-to-endpoint distances.
#[must_use]
pub fn segment_distance(p: Line<f64>, q: Line<f64>) -> f64 {
    let (p1, p2) = (p.start, p.end);
    let (q1, q2) = (q.start, q.end);

    let denom = (q2.y - q1.y).mul_add(p2.x - p1.x, -((q2.x - q1.x) * (p2.y - p1.y)));
    if denom.abs() > f64::EPSILON {
        let ua = (q2.x - q1.x).mul_add(p1.y - q1.y, -((q2.y - q1.y) * (p1.x - q1.x))) / denom;
        let ub = (p2.x - p1.x).mul_add(p1.y - q1.y, -((p2.y - p1.y) * (p1.x - q1.x))) / denom;
        if (0.0..=1.0).contains(&ua) && (0.0..=1.0).contains(&ub) {
            let crossing = Coord {
                x: ua.mul_add(p2.x - p1.x, p1.x),
                y: ua.mul_add(p2.y - p1.y, p1.y),
            };
            return distance(p1, crossing);
        }
    }

    [
        distance(p1, q1),
        distance(p1, q2),
        distance(p2, q1),
        distance(p2, q2),
    ]
    .into_iter()
    .fold(f64::INFINITY, f64::min)
}

/// Gap between the bounding boxes of two outlines, zero when they touch
/// or overlap. Never exceeds [`closest_distance`], so it can rule pairs
/// out before the edge scan.
#[must_use]
pub fn envelope_gap(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> f64 {
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => rect_gap(ra, rb),
        _ => f64::INFINITY,
    }
}

fn rect_gap(a: Rect<f64>, b: Rect<f64>) -> f64 {
    let dx = (b.min().x - a.max().x).max(a.min().x - b.max().x).max(0.0);
    let dy = (b.min().y - a.max().y).max(a.min().y - b.max().y).max(0.0);
    dx.hypot(dy)
}

/// Whether two outlines share interior area. Touching along an edge or
/// at a vertex is not overlap.
#[must_use]
pub fn overlaps(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    if a.0.is_empty() || b.0.is_empty() {
        return false;
    }
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => {
            let disjoint = ra.max().x <= rb.min().x
                || rb.max().x <= ra.min().x
                || ra.max().y <= rb.min().y
                || rb.max().y <= ra.min().y;
            !disjoint && a.intersection(b).unsigned_area() > 0.0
        }
        _ => false,
    }
}

fn edges(outline: &MultiPolygon<f64>) -> impl Iterator<Item = Line<f64>> + '_ {
    outline
        .iter()
        .flat_map(|poly| std::iter::once(poly.exterior()).chain(poly.interiors()))
        .flat_map(LineString::lines)
}

fn distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}
