//! Regions: an outline polygon plus the exact set of pixels it covers.
//!
//! Outlines live in pixel-edge coordinates: pixel `(x, y)` is the unit
//! square `[x, x + 1] × [y, y + 1]`, so an outline traced from a pixel
//! set encloses exactly `pixels.len()` square units.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::f64::consts::{PI, SQRT_2};

use geo::{
    Area, BooleanOps, BoundingRect, Contains, Coord, Line, LineString, MultiPolygon, Polygon, Rect,
};

use image::{GrayImage, Luma};
use imageproc::region_labelling::Connectivity;

use crate::types::Pixel;

/// A polygon-bounded foreground area and its contained pixels.
///
/// Equality is geometric: two regions are equal when they cover the same
/// pixels with the same outline, whatever their display names.
#[derive(Debug, Clone)]
pub struct Region {
    name: String,
    outline: MultiPolygon<f64>,
    pixels: BTreeSet<Pixel>,
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.pixels == other.pixels && self.outline == other.outline
    }
}

impl Region {
    /// Build a region from a pixel set, tracing its outline.
    ///
    /// Pixels that touch only at a corner end up in separate polygons of
    /// the outline; the pixel set still holds all of them.
    #[must_use]
    pub fn from_pixels(name: impl Into<String>, pixels: impl IntoIterator<Item = Pixel>) -> Self {
        let pixels: BTreeSet<Pixel> = pixels.into_iter().collect();
        let outline = trace_outline(&pixels);
        Self {
            name: name.into(),
            outline,
            pixels,
        }
    }

    /// Build a region from an arbitrary outline, e.g. one redrawn by a
    /// reviewer. Contained pixels are those whose centres fall inside.
    #[must_use]
    pub fn from_outline(name: impl Into<String>, outline: MultiPolygon<f64>) -> Self {
        let pixels = rasterize(&outline);
        Self {
            name: name.into(),
            outline,
            pixels,
        }
    }

    /// An enclosed background pocket: a solid outline with no foreground
    /// pixels of its own.
    pub(crate) fn hole(name: impl Into<String>, ring: LineString<f64>) -> Self {
        Self {
            name: name.into(),
            outline: MultiPolygon::new(vec![Polygon::new(ring, vec![])]),
            pixels: BTreeSet::new(),
        }
    }

    /// Display name, e.g. `"r 3"`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Outline polygon(s).
    #[must_use]
    pub const fn outline(&self) -> &MultiPolygon<f64> {
        &self.outline
    }

    /// Contained pixels in raster-scan order.
    #[must_use]
    pub const fn pixels(&self) -> &BTreeSet<Pixel> {
        &self.pixels
    }

    /// Number of contained pixels.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.pixels.len()
    }

    /// Whether the region covers pixel `(x, y)`.
    #[must_use]
    pub fn contains_pixel(&self, x: u32, y: u32) -> bool {
        self.pixels.contains(&Pixel::new(x, y))
    }

    /// Axis-aligned bounds of the outline.
    #[must_use]
    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.outline.bounding_rect()
    }

    /// Union of both outlines and both pixel sets. Keeps `self`'s name.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let outline = if other.outline.0.is_empty() {
            self.outline.clone()
        } else if self.outline.0.is_empty() {
            other.outline.clone()
        } else {
            self.outline.union(&other.outline)
        };
        Self {
            name: self.name.clone(),
            outline,
            pixels: self.pixels.union(&other.pixels).copied().collect(),
        }
    }

    /// Pixels of `self` not covered by `other`, outline traced again.
    /// Keeps `self`'s name.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self::from_pixels(
            self.name.clone(),
            self.pixels.difference(&other.pixels).copied(),
        )
    }

    /// Percentage of the bounding box covered by contained pixels.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fill_percent(&self) -> f64 {
        let Some(rect) = self.bounds() else {
            return 0.0;
        };
        let box_area = rect.width() * rect.height();
        if box_area <= 0.0 {
            return 0.0;
        }
        self.pixels.len() as f64 / box_area * 100.0
    }

    /// Outline with interior rings dropped.
    #[must_use]
    pub fn solid_outline(&self) -> MultiPolygon<f64> {
        self.outline
            .iter()
            .map(|p| Polygon::new(p.exterior().clone(), vec![]))
            .collect()
    }

    /// Pixels inside the outer boundary, interior holes included.
    #[must_use]
    pub fn filled_pixels(&self) -> BTreeSet<Pixel> {
        rasterize(&self.solid_outline())
    }

    /// Perimeter of the outer boundary.
    ///
    /// Axis-aligned (traced) rings use the corner-corrected crack length
    /// so that staircase diagonals are not over-counted; other rings use
    /// their Euclidean length.
    #[must_use]
    pub fn perimeter(&self) -> f64 {
        self.outline
            .iter()
            .map(|p| ring_perimeter(p.exterior()))
            .sum()
    }

    /// `4π · area / perimeter²`, capped at 1. Area is the pixel count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn circularity(&self) -> f64 {
        let perimeter = self.perimeter();
        if perimeter <= 0.0 {
            return 0.0;
        }
        let area = self.pixels.len() as f64;
        (4.0 * PI * area / (perimeter * perimeter)).min(1.0)
    }

    /// Area enclosed by the outline in square pixels.
    #[must_use]
    pub fn outline_area(&self) -> f64 {
        self.outline.unsigned_area()
    }
}

/// Group the non-zero pixels of `mask` into 8-connected components,
/// ordered by each component's first pixel in raster-scan order.
#[must_use]
pub fn connected_components(mask: &GrayImage) -> Vec<Vec<Pixel>> {
    let labels = imageproc::region_labelling::connected_components(
        mask,
        Connectivity::Eight,
        Luma([0u8]),
    );

    let mut groups: BTreeMap<u32, Vec<Pixel>> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        if label.0[0] != 0 {
            groups.entry(label.0[0]).or_default().push(Pixel::new(x, y));
        }
    }

    // Pixels are visited row by row, so each group's first entry is its
    // raster-scan minimum.
    let mut components: Vec<Vec<Pixel>> = groups.into_values().collect();
    components.sort_by_key(|c| c.first().copied());
    components
}

/// Pixel centres inside `outline`, clipped to non-negative coordinates.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rasterize(outline: &MultiPolygon<f64>) -> BTreeSet<Pixel> {
    let Some(rect) = outline.bounding_rect() else {
        return BTreeSet::new();
    };
    let x0 = rect.min().x.floor().max(0.0) as u32;
    let y0 = rect.min().y.floor().max(0.0) as u32;
    let x1 = rect.max().x.ceil().max(0.0) as u32;
    let y1 = rect.max().y.ceil().max(0.0) as u32;

    let mut pixels = BTreeSet::new();
    for y in y0..y1 {
        for x in x0..x1 {
            let pixel = Pixel::new(x, y);
            if outline.contains(&geo::Point::from(pixel.center())) {
                pixels.insert(pixel);
            }
        }
    }
    pixels
}

fn ring_perimeter(ring: &LineString<f64>) -> f64 {
    let is_vertical = |l: &Line<f64>| l.dx().abs() < f64::EPSILON;
    let is_horizontal = |l: &Line<f64>| l.dy().abs() < f64::EPSILON;

    let lines: Vec<Line<f64>> = ring
        .lines()
        .filter(|l| !(is_vertical(l) && is_horizontal(l)))
        .collect();
    if !lines.iter().all(|l| is_vertical(l) || is_horizontal(l)) {
        return lines.iter().map(|l| l.dx().hypot(l.dy())).sum();
    }

    let mut length = 0.0;
    let mut corners = 0_u32;
    for (i, line) in lines.iter().enumerate() {
        length += line.dx().abs() + line.dy().abs();
        let prev = &lines[(i + lines.len() - 1) % lines.len()];
        if is_vertical(prev) != is_vertical(line) {
            corners += 1;
        }
    }
    f64::from(corners).mul_add(-(2.0 - SQRT_2), length)
}

// ───────────────────────── Outline tracing ─────────────────────────

type Vertex = (i64, i64);

/// A unit boundary edge between a foreground pixel and the background.
/// Edges run clockwise around their pixel (y pointing down), so outer
/// boundaries get positive shoelace area and holes negative.
struct Crack {
    from: Vertex,
    to: Vertex,
    pixel: Pixel,
}

fn collect_cracks(pixels: &BTreeSet<Pixel>) -> Vec<Crack> {
    let has = |x: i64, y: i64| match (u32::try_from(x), u32::try_from(y)) {
        (Ok(x), Ok(y)) => pixels.contains(&Pixel::new(x, y)),
        _ => false,
    };

    let mut cracks = Vec::new();
    for &pixel in pixels {
        let (x, y) = (i64::from(pixel.x), i64::from(pixel.y));
        let sides = [
            (has(x, y - 1), (x, y), (x + 1, y)),
            (has(x + 1, y), (x + 1, y), (x + 1, y + 1)),
            (has(x, y + 1), (x + 1, y + 1), (x, y + 1)),
            (has(x - 1, y), (x, y + 1), (x, y)),
        ];
        for (neighbour, from, to) in sides {
            if !neighbour {
                cracks.push(Crack { from, to, pixel });
            }
        }
    }
    cracks
}

/// Chain cracks into closed rings.
///
/// Where two pixels meet only at a corner, the vertex has two outgoing
/// cracks; the one belonging to the incoming crack's pixel is followed,
/// which keeps every ring simple.
fn chain_rings(cracks: &[Crack]) -> Vec<(Vec<Vertex>, Pixel)> {
    let mut outgoing: HashMap<Vertex, Vec<usize>> = HashMap::new();
    for (i, crack) in cracks.iter().enumerate() {
        outgoing.entry(crack.from).or_default().push(i);
    }

    let mut used = vec![false; cracks.len()];
    let mut rings = Vec::new();
    for start in 0..cracks.len() {
        if used[start] {
            continue;
        }
        let mut ring = Vec::new();
        let mut current = start;
        loop {
            used[current] = true;
            let crack = &cracks[current];
            ring.push(crack.from);
            let Some(candidates) = outgoing.get(&crack.to) else {
                break;
            };
            let next = candidates
                .iter()
                .copied()
                .find(|&c| cracks[c].pixel == crack.pixel)
                .or_else(|| candidates.first().copied());
            match next {
                Some(n) if n != start && !used[n] => current = n,
                _ => break,
            }
        }
        rings.push((drop_collinear(ring), cracks[start].pixel));
    }
    rings
}

fn drop_collinear(ring: Vec<Vertex>) -> Vec<Vertex> {
    let n = ring.len();
    if n < 4 {
        return ring;
    }
    (0..n)
        .filter(|&i| {
            let prev = ring[(i + n - 1) % n];
            let cur = ring[i];
            let next = ring[(i + 1) % n];
            let cross = (cur.0 - prev.0) * (next.1 - cur.1) - (cur.1 - prev.1) * (next.0 - cur.0);
            cross != 0
        })
        .map(|i| ring[i])
        .collect()
}

fn signed_area(ring: &[Vertex]) -> i64 {
    let n = ring.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let (x0, y0) = ring[i];
            let (x1, y1) = ring[(i + 1) % n];
            x0 * y1 - x1 * y0
        })
        .sum();
    twice / 2
}

#[allow(clippy::cast_precision_loss)]
fn to_line_string(ring: &[Vertex]) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|&(x, y)| Coord {
            x: x as f64,
            y: y as f64,
        })
        .collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    LineString::new(coords)
}

fn trace_outline(pixels: &BTreeSet<Pixel>) -> MultiPolygon<f64> {
    let rings = chain_rings(&collect_cracks(pixels));

    let mut outers: Vec<(i64, Polygon<f64>)> = Vec::new();
    let mut holes: Vec<(LineString<f64>, Pixel)> = Vec::new();
    for (ring, pixel) in rings {
        let area = signed_area(&ring);
        if area > 0 {
            outers.push((area, Polygon::new(to_line_string(&ring), vec![])));
        } else if area < 0 {
            holes.push((to_line_string(&ring), pixel));
        }
    }

    // A hole belongs to the smallest outer ring enclosing the pixel that
    // bounds it; larger enclosing rings belong to surrounding components.
    let mut interiors: Vec<Vec<LineString<f64>>> = vec![Vec::new(); outers.len()];
    for (hole, pixel) in holes {
        let center = geo::Point::from(pixel.center());
        let owner = outers
            .iter()
            .enumerate()
            .filter(|(_, (_, poly))| poly.contains(&center))
            .min_by_key(|(_, (area, _))| *area)
            .map(|(i, _)| i);
        if let Some(i) = owner {
            interiors[i].push(hole);
        }
    }

    outers
        .into_iter()
        .zip(interiors)
        .map(|((_, poly), holes)| {
            let (exterior, _) = poly.into_inner();
            Polygon::new(exterior, holes)
        })
        .collect()
}
