//! End-to-end STARFM behavior: copy-through cases, channel factorization,
//! tile independence and the double-pair advantage.

use std::sync::Arc;
use stf_core::{Image, MultiResImages, PixelKind, Rect};
use stf_fusion::{
    DataFusor, PairDates, Parallelizer, ParallelizerOptions, StarfmFusor, StarfmOptions,
};
use stf_tests::{image_from_fn, images_equal, l1_error, mirrored_change_set, textured_scene};

fn base_options() -> StarfmOptions {
    StarfmOptions {
        high_tag: "high".into(),
        low_tag: "low".into(),
        pair_dates: PairDates::Single(1),
        window_size: 7,
        number_classes: 40,
        spectral_uncertainty: 500.0,
        temporal_uncertainty: 500.0,
        ..StarfmOptions::default()
    }
}

#[test]
fn zero_temporal_diff_returns_pair_high() {
    // H[x, y] = x + 10y, coarse images unchanged across dates
    let h1 = image_from_fn(7, 7, PixelKind::U16, 1, |x, y, _| f64::from(x + 10 * y));
    let mut imgs = MultiResImages::new();
    imgs.set("high", 1, h1.shared_copy());
    imgs.set("low", 1, h1.shared_copy());
    imgs.set("low", 2, h1.shared_copy());

    let mut opt = base_options();
    opt.copy_on_zero_diff = true;
    let mut f = StarfmFusor::new();
    f.set_src_images(Arc::new(imgs));
    f.process_options(&opt).unwrap();
    f.predict(2, None).unwrap();
    assert!(images_equal(f.output(), &h1));
}

#[test]
fn zero_spectral_diff_returns_target_low() {
    let h1 = textured_scene(9, 9, 1, 3);
    let l2 = Image::filled(9, 9, PixelKind::U16, 1, 255.0).unwrap();
    let mut imgs = MultiResImages::new();
    imgs.set("high", 1, h1.shared_copy());
    imgs.set("low", 1, h1.shared_copy()); // spectrally identical pair
    imgs.set("low", 2, l2.shared_copy());

    let mut opt = base_options();
    opt.copy_on_zero_diff = true;
    let mut f = StarfmFusor::new();
    f.set_src_images(Arc::new(imgs));
    f.process_options(&opt).unwrap();
    f.predict(2, None).unwrap();
    assert!(images_equal(f.output(), &l2));
}

#[test]
fn copy_through_when_nothing_changes() {
    // H identical to L and L unchanged across dates: the prediction is L
    let scene = textured_scene(12, 10, 1, 1);
    let mut imgs = MultiResImages::new();
    imgs.set("high", 1, scene.shared_copy());
    imgs.set("low", 1, scene.shared_copy());
    imgs.set("low", 2, scene.shared_copy());

    let mut opt = base_options();
    opt.copy_on_zero_diff = true;
    let mut f = StarfmFusor::new();
    f.set_src_images(Arc::new(imgs));
    f.process_options(&opt).unwrap();
    f.predict(2, None).unwrap();
    assert!(images_equal(f.output(), &scene));
}

fn textured_store(channels: u32) -> MultiResImages {
    let h1 = textured_scene(24, 18, channels, 1);
    let l1 = stf_tests::box_blur3(&h1);
    let h2 = textured_scene(24, 18, channels, 2);
    let l2 = stf_tests::box_blur3(&h2);
    let mut imgs = MultiResImages::new();
    imgs.set("high", 1, h1);
    imgs.set("low", 1, l1);
    imgs.set("low", 2, l2);
    imgs
}

#[test]
fn serial_equals_parallel_equals_cropped() {
    let imgs = Arc::new(textured_store(1));
    let opt = base_options();

    let mut serial = StarfmFusor::new();
    serial.set_src_images(Arc::clone(&imgs));
    serial.process_options(&opt).unwrap();
    serial.predict(2, None).unwrap();
    let full = serial.output().clone_owned();

    // parallel with several stripe counts must be bit-identical
    for threads in [1, 2, 3, 5] {
        let mut sample = StarfmFusor::new();
        sample.process_options(&opt).unwrap();
        let mut par = Parallelizer::new(sample);
        par.set_src_images(Arc::clone(&imgs));
        par.process_options(&ParallelizerOptions {
            threads,
            ..ParallelizerOptions::default()
        })
        .unwrap();
        par.predict(2, None).unwrap();
        assert!(
            images_equal(par.output(), &full),
            "parallel prediction with {threads} stripes diverged"
        );
    }

    // predicting a sub-area equals cropping the full prediction
    let crop = Rect::new(5, 4, 24 - 9, 18 - 7);
    let mut cropped = StarfmFusor::new();
    cropped.set_src_images(Arc::clone(&imgs));
    let mut o = opt;
    o.prediction_area = crop;
    cropped.process_options(&o).unwrap();
    cropped.predict(2, None).unwrap();
    let reference = full.shared_crop(crop).unwrap().clone_owned();
    assert!(images_equal(cropped.output(), &reference));
}

#[test]
fn multi_channel_prediction_factorizes() {
    let imgs = Arc::new(textured_store(3));
    let opt = base_options();

    let mut multi = StarfmFusor::new();
    multi.set_src_images(Arc::clone(&imgs));
    multi.process_options(&opt).unwrap();
    multi.predict(2, None).unwrap();
    let split = multi.output().split();

    for c in 0..3u32 {
        let mut single_store = MultiResImages::new();
        for (tag, date) in [("high", 1), ("low", 1), ("low", 2)] {
            let channel_img = imgs.get(tag, date).unwrap().split()[c as usize].shared_copy();
            single_store.set(tag, date, channel_img);
        }
        let mut single = StarfmFusor::new();
        single.set_src_images(Arc::new(single_store));
        single.process_options(&opt).unwrap();
        single.predict(2, None).unwrap();
        assert!(
            images_equal(single.output(), &split[c as usize]),
            "channel {c} diverged from the single-channel prediction"
        );
    }
}

#[test]
fn masked_pixels_keep_output_defaults() {
    let imgs = Arc::new(textured_store(1));
    let mut mask = Image::filled(24, 18, PixelKind::U8, 1, 255.0).unwrap();
    for y in 4..9 {
        for x in 6..12 {
            mask.set_pixel::<u8>(x, y, 0, 0);
        }
    }

    let mut f = StarfmFusor::new();
    f.set_src_images(Arc::clone(&imgs));
    f.process_options(&base_options()).unwrap();
    f.predict(2, Some(&mask)).unwrap();

    // a fresh output buffer is zero-initialized; masked pixels stay that way
    for y in 4..9 {
        for x in 6..12 {
            assert_eq!(f.output().pixel::<u16>(x, y, 0), 0);
        }
    }
    // valid pixels were written
    assert_ne!(f.output().pixel::<u16>(0, 0, 0), 0);
}

#[test]
fn double_pair_beats_both_single_pairs() {
    let (imgs, reference) = mirrored_change_set(21, 17).unwrap();
    let imgs = Arc::new(imgs);

    let mut opt = base_options();
    let mut errors = Vec::new();
    for dates in [
        PairDates::Single(1),
        PairDates::Single(3),
        PairDates::Double(1, 3),
    ] {
        opt.pair_dates = dates;
        let mut f = StarfmFusor::new();
        f.set_src_images(Arc::clone(&imgs));
        f.process_options(&opt).unwrap();
        f.predict(2, None).unwrap();
        errors.push(l1_error(f.output(), &reference));
    }

    let (from1, from3, combined) = (errors[0], errors[1], errors[2]);
    assert!(from1 > 0.0 && from3 > 0.0, "single pairs should not be exact");
    assert!(
        combined < from1 && combined < from3,
        "double pair {combined} should beat both single pairs {from1} / {from3}"
    );
}
