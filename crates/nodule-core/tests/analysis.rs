//! Integration tests: synthetic nodule images through the whole analysis.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use image::{GrayImage, Luma, Rgb, RgbImage};
use nodule_core::{
    AcceptAll, Channel, NoduleConfig, NoduleError, Pipeline, ScriptedReviewer,
};

const RED: Rgb<u8> = Rgb([200, 20, 20]);
const GREEN: Rgb<u8> = Rgb([40, 200, 40]);
const MIXED: Rgb<u8> = Rgb([120, 120, 20]);

struct Canvas {
    image: RgbImage,
    mask: GrayImage,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
            mask: GrayImage::new(width, height),
        }
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb<u8>) {
        let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
            return;
        };
        if x < self.image.width() && y < self.image.height() {
            self.image.put_pixel(x, y, color);
            self.mask.put_pixel(x, y, Luma([255]));
        }
    }

    fn disc(mut self, color: Rgb<u8>, cx: i64, cy: i64, r: i64) -> Self {
        for y in (cy - r)..=(cy + r) {
            for x in (cx - r)..=(cx + r) {
                if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                    self.put(x, y, color);
                }
            }
        }
        self
    }

    fn rect(mut self, color: Rgb<u8>, x0: i64, y0: i64, w: i64, h: i64) -> Self {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                self.put(x, y, color);
            }
        }
        self
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn clump_config() -> NoduleConfig {
    NoduleConfig {
        red_single_upper_bound: 1000,
        improve_segmentation: false,
        ..NoduleConfig::default()
    }
}

/// Three round red nodules and a long red bar that reads as a clump.
fn clump_canvas() -> Canvas {
    Canvas::new(300, 200)
        .disc(RED, 30, 30, 12)
        .disc(RED, 80, 30, 12)
        .disc(RED, 130, 30, 12)
        .rect(RED, 20, 100, 200, 12)
}

#[test]
fn black_background_survives_widening() {
    init_logs();
    let canvas = Canvas::new(120, 80)
        .disc(RED, 30, 40, 14)
        .disc(GREEN, 90, 40, 14);
    let result = nodule_core::analyze(
        canvas.image,
        canvas.mask,
        &NoduleConfig::default(),
        &mut AcceptAll,
    )
    .unwrap();
    let summary = result.summary();
    assert_eq!((summary.red, summary.green, summary.mixed), (1, 1, 0));
}

#[test]
fn oversized_bar_is_counted_as_clump() {
    init_logs();
    let canvas = clump_canvas();
    let result =
        nodule_core::analyze(canvas.image, canvas.mask, &clump_config(), &mut AcceptAll).unwrap();

    assert_eq!(result.red.rows.len(), 4);
    let bar = &result.red.rows[3];
    let clump = bar.clump.as_ref().expect("bar should be a clump");
    assert!(clump.nodule_count >= 2, "got {}", clump.nodule_count);
    assert_eq!(bar.nodule_count, clump.nodule_count);
    assert_eq!(result.red.total_nodule_count, 3 + clump.nodule_count);
    assert!(result.red.rows[..3].iter().all(|r| r.clump.is_none()));
}

#[test]
fn reviewer_recount_moves_total() {
    init_logs();
    let canvas = clump_canvas();
    let mut reviewer = ScriptedReviewer::new().with_counts([-4, 7]);
    let result =
        nodule_core::analyze(canvas.image, canvas.mask, &clump_config(), &mut reviewer).unwrap();
    assert_eq!(result.red.rows[3].nodule_count, 7);
    assert_eq!(result.red.total_nodule_count, 10);
    assert_eq!(reviewer.asked().len(), 2, "invalid answer is asked again");
}

#[test]
fn reviewer_can_empty_a_clump() {
    let canvas = clump_canvas();
    let mut reviewer = ScriptedReviewer::new().with_counts([0]);
    let result =
        nodule_core::analyze(canvas.image, canvas.mask, &clump_config(), &mut reviewer).unwrap();
    assert_eq!(result.red.rows.len(), 3);
    assert_eq!(result.red.total_nodule_count, 3);
}

#[test]
fn mixed_region_claims_one_nodule_of_a_clump() {
    init_logs();
    // Mixed blob sitting on the right end of the bar.
    let canvas = clump_canvas().rect(MIXED, 220, 96, 20, 20);
    let merged = Pipeline::new(canvas.image, canvas.mask, clump_config())
        .unwrap()
        .refine()
        .unwrap()
        .partition()
        .unwrap()
        .detect()
        .absorb_holes()
        .unwrap()
        .redetect()
        .unwrap()
        .split_clumps(&mut AcceptAll)
        .unwrap()
        .merge_mixed(&mut AcceptAll)
        .unwrap();
    assert_eq!(merged.absorbed().linked, 1);
    assert_eq!(merged.absorbed().absorbed, 0);

    let red = merged.dataset(Channel::Red);
    let bar = red.id_at(3).unwrap();
    let clump = red.clump(bar).unwrap();
    assert!(clump.has_mixed());
    let per_nodule = clump.area_per_nodule();
    let clump_count = clump.nodule_count();

    let mixed = merged.mixed();
    let m = mixed.base().id_at(0).unwrap();
    assert_eq!(mixed.linkage(m).red, Some(bar));
    let (red_part, green_part) = mixed.split(m);
    assert_eq!(f64::from(red_part), per_nodule.trunc());
    assert_eq!(green_part, 400, "mixed pixels classify as green");

    // The clump's region is redrawn as the merged shape.
    assert_eq!(
        red.region(bar).unwrap().pixel_count(),
        mixed.base().region(m).unwrap().pixel_count()
    );

    let result = merged.into_result().unwrap();
    let split = result.mixed.rows[0].mixed.unwrap();
    assert_eq!((split.red_link, split.green_link), (3, -1));
    let summary = result.summary();
    assert_eq!(summary.red, 3 + clump_count - 1, "lent nodule counts as mixed");
    assert_eq!(summary.total(), 3 + clump_count);
}

#[test]
fn deleting_clump_in_session_drops_linked_mixed_region() {
    let canvas = clump_canvas().rect(MIXED, 220, 96, 20, 20);
    let mut session = Pipeline::new(canvas.image, canvas.mask, clump_config())
        .unwrap()
        .refine()
        .unwrap()
        .partition()
        .unwrap()
        .detect()
        .absorb_holes()
        .unwrap()
        .redetect()
        .unwrap()
        .split_clumps(&mut AcceptAll)
        .unwrap()
        .merge_mixed(&mut AcceptAll)
        .unwrap()
        .into_session();

    let (channel, bar) = session.region_at(100, 105).unwrap();
    assert_eq!(channel, Channel::Red);
    let removed = session.delete_region(channel, bar).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(matches!(
        session.delete_region(channel, bar),
        Err(NoduleError::NotFound(_))
    ));

    let result = session.finish().unwrap();
    assert_eq!(result.summary().red, 3);
    assert_eq!(result.summary().mixed, 0);
}

#[test]
fn ring_nodule_is_measured_solid() {
    let mut canvas = Canvas::new(80, 80).rect(GREEN, 10, 10, 40, 40);
    for y in 20..40 {
        for x in 20..40 {
            canvas.mask.put_pixel(x, y, Luma([0]));
        }
    }
    let config = NoduleConfig {
        improve_segmentation: false,
        ..NoduleConfig::default()
    };
    let result = nodule_core::analyze(canvas.image, canvas.mask, &config, &mut AcceptAll).unwrap();
    assert_eq!(result.green.rows.len(), 1);
    assert_eq!(result.green.rows[0].pixel_area, 1600);
}

#[test]
fn config_json_round_trip() {
    let config = clump_config();
    let json = serde_json::to_string(&config).unwrap();
    let back: NoduleConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}
