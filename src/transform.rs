//! Per-image preprocessing: the random training pipeline and the deterministic
//! evaluation pipeline. Both end in an ImageNet-normalized `[3, size, size]` buffer.
//!
//! Geometric augmentation (rotation, shear/translate, perspective) is folded into a
//! single projective matrix so each training image is resampled only once after the crop.

use image::{
    imageops::{self, FilterType},
    DynamicImage, Rgb, RgbImage,
};
use ndarray::{s, Array2, Array3, Axis};
use rand::{seq::SliceRandom, Rng};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub const CHANNELS: usize = 3;

#[derive(Debug, Clone)]
pub enum Transform {
    Train(TrainTransform),
    Eval(EvalTransform),
}

impl Transform {
    pub fn apply<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> Array3<f32> {
        match self {
            Transform::Train(t) => t.apply(image, rng),
            Transform::Eval(t) => t.apply(image),
        }
    }
}

/// Resize the shorter side, then centre-crop a square.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalTransform {
    pub resize: u32,
    pub crop: u32,
}

impl EvalTransform {
    pub fn new(resize: u32, crop: u32) -> Self {
        Self { resize, crop }
    }

    /// Validation pipeline at a training resolution: shorter side to `floor(size * 1.14)`.
    pub fn for_size(size: u32) -> Self {
        Self::new((size as f64 * 1.14) as u32, size)
    }

    /// Fixed pipeline used by the serving endpoint.
    pub fn inference() -> Self {
        Self::new(256, 224)
    }

    pub fn apply(&self, image: &DynamicImage) -> Array3<f32> {
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        let (new_w, new_h) = if w <= h {
            (self.resize, (self.resize as u64 * h as u64 / w.max(1) as u64) as u32)
        } else {
            ((self.resize as u64 * w as u64 / h.max(1) as u64) as u32, self.resize)
        };
        let resized = imageops::resize(&rgb, new_w.max(1), new_h.max(1), FilterType::Triangle);
        let cropped = center_crop(&resized, self.crop);

        let mut pixels = to_chw(&cropped);
        normalize(&mut pixels);
        pixels
    }
}

fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w < size || h < size {
        return imageops::resize(image, size, size, FilterType::Triangle);
    }
    let left = ((w - size) as f64 / 2.0).round() as u32;
    let top = ((h - size) as f64 / 2.0).round() as u32;
    imageops::crop_imm(image, left, top, size, size).to_image()
}

#[derive(Debug, Clone)]
pub struct TrainTransform {
    pub size: u32,
    pub crop_scale: (f64, f64),
    pub crop_ratio: (f64, f64),
    pub flip_prob: f32,
    pub rotation_degrees: f32,
    /// Maximum translation as a fraction of width/height.
    pub translate: f32,
    pub shear_degrees: f32,
    pub perspective_distortion: f32,
    pub perspective_prob: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    /// Fraction of the hue circle, at most 0.5.
    pub hue: f32,
    pub grayscale_prob: f32,
    pub erase_prob: f32,
    pub erase_scale: (f64, f64),
    pub erase_ratio: (f64, f64),
}

impl TrainTransform {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            crop_scale: (0.6, 1.0),
            crop_ratio: (3.0 / 4.0, 4.0 / 3.0),
            flip_prob: 0.5,
            rotation_degrees: 25.0,
            translate: 0.15,
            shear_degrees: 10.0,
            perspective_distortion: 0.2,
            perspective_prob: 0.3,
            brightness: 0.4,
            contrast: 0.4,
            saturation: 0.4,
            hue: 0.15,
            grayscale_prob: 0.15,
            erase_prob: 0.2,
            erase_scale: (0.02, 0.15),
            erase_ratio: (0.3, 3.3),
        }
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> Array3<f32> {
        let rgb = image.to_rgb8();

        let mut img = self.random_resized_crop(&rgb, rng);
        if rng.gen::<f32>() < self.flip_prob {
            img = imageops::flip_horizontal(&img);
        }
        if let Some(inverse) = self.random_warp(img.width(), img.height(), rng).invert() {
            img = warp(&img, &inverse);
        }

        let mut pixels = to_chw(&img);
        self.color_jitter(&mut pixels, rng);
        if rng.gen::<f32>() < self.grayscale_prob {
            let gray = luminance(&pixels);
            for mut channel in pixels.axis_iter_mut(Axis(0)) {
                channel.assign(&gray);
            }
        }
        normalize(&mut pixels);
        if rng.gen::<f32>() < self.erase_prob {
            self.random_erase(&mut pixels, rng);
        }
        pixels
    }

    fn random_resized_crop<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let (w, h) = image.dimensions();
        let area = (w * h) as f64;
        let (log_lo, log_hi) = (self.crop_ratio.0.ln(), self.crop_ratio.1.ln());

        for _ in 0..10 {
            let target_area = area * rng.gen_range(self.crop_scale.0..=self.crop_scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();
            let cw = (target_area * aspect).sqrt().round() as u32;
            let ch = (target_area / aspect).sqrt().round() as u32;
            if cw > 0 && ch > 0 && cw <= w && ch <= h {
                let left = rng.gen_range(0..=w - cw);
                let top = rng.gen_range(0..=h - ch);
                let crop = imageops::crop_imm(image, left, top, cw, ch).to_image();
                return imageops::resize(&crop, self.size, self.size, FilterType::Triangle);
            }
        }

        // centre crop clamped to the allowed aspect range
        let in_ratio = w as f64 / h as f64;
        let (cw, ch) = if in_ratio < self.crop_ratio.0 {
            (w, (w as f64 / self.crop_ratio.0).round() as u32)
        } else if in_ratio > self.crop_ratio.1 {
            ((h as f64 * self.crop_ratio.1).round() as u32, h)
        } else {
            (w, h)
        };
        let (cw, ch) = (cw.clamp(1, w), ch.clamp(1, h));
        let crop = imageops::crop_imm(image, (w - cw) / 2, (h - ch) / 2, cw, ch).to_image();
        imageops::resize(&crop, self.size, self.size, FilterType::Triangle)
    }

    /// Forward mapping (source to destination) for rotation, affine and perspective.
    fn random_warp<R: Rng + ?Sized>(&self, w: u32, h: u32, rng: &mut R) -> Mat3 {
        let (cx, cy) = ((w as f32 - 1.0) / 2.0, (h as f32 - 1.0) / 2.0);

        let angle = rng
            .gen_range(-self.rotation_degrees..=self.rotation_degrees)
            .to_radians();
        let rotation = Mat3::translation(cx, cy)
            .mul(&Mat3::rotation(angle))
            .mul(&Mat3::translation(-cx, -cy));

        let max_dx = self.translate * w as f32;
        let max_dy = self.translate * h as f32;
        let tx = rng.gen_range(-max_dx..=max_dx).round();
        let ty = rng.gen_range(-max_dy..=max_dy).round();
        let shear = rng
            .gen_range(-self.shear_degrees..=self.shear_degrees)
            .to_radians();
        let affine = Mat3::translation(cx + tx, cy + ty)
            .mul(&Mat3::shear_x(shear))
            .mul(&Mat3::translation(-cx, -cy));

        let mut forward = affine.mul(&rotation);

        if rng.gen::<f32>() < self.perspective_prob {
            if let Some(perspective) = self.random_perspective(w, h, rng) {
                forward = perspective.mul(&forward);
            }
        }
        forward
    }

    fn random_perspective<R: Rng + ?Sized>(&self, w: u32, h: u32, rng: &mut R) -> Option<Mat3> {
        let (w, h) = (w as f32 - 1.0, h as f32 - 1.0);
        let dx = self.perspective_distortion * w / 2.0;
        let dy = self.perspective_distortion * h / 2.0;
        let mut jitter = |x: f32, y: f32, sx: f32, sy: f32| {
            [
                x + sx * rng.gen_range(0.0..=dx),
                y + sy * rng.gen_range(0.0..=dy),
            ]
        };

        let start = [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]];
        let end = [
            jitter(0.0, 0.0, 1.0, 1.0),
            jitter(w, 0.0, -1.0, 1.0),
            jitter(w, h, -1.0, -1.0),
            jitter(0.0, h, 1.0, -1.0),
        ];
        Mat3::homography(&start, &end)
    }

    fn color_jitter<R: Rng + ?Sized>(&self, pixels: &mut Array3<f32>, rng: &mut R) {
        let mut order = [0, 1, 2, 3];
        order.shuffle(rng);

        for op in order {
            match op {
                0 if self.brightness > 0.0 => {
                    let f = factor(self.brightness, rng);
                    pixels.mapv_inplace(|v| (v * f).clamp(0.0, 1.0));
                }
                1 if self.contrast > 0.0 => {
                    let f = factor(self.contrast, rng);
                    let mean = luminance(pixels).mean().unwrap_or(0.0);
                    pixels.mapv_inplace(|v| (f * v + (1.0 - f) * mean).clamp(0.0, 1.0));
                }
                2 if self.saturation > 0.0 => {
                    let f = factor(self.saturation, rng);
                    let gray = luminance(pixels);
                    for mut channel in pixels.axis_iter_mut(Axis(0)) {
                        channel.zip_mut_with(&gray, |v, &g| {
                            *v = (f * *v + (1.0 - f) * g).clamp(0.0, 1.0)
                        });
                    }
                }
                3 if self.hue > 0.0 => {
                    let shift = rng.gen_range(-self.hue..=self.hue);
                    shift_hue(pixels, shift);
                }
                _ => {}
            }
        }
    }

    fn random_erase<R: Rng + ?Sized>(&self, pixels: &mut Array3<f32>, rng: &mut R) {
        let (_, h, w) = pixels.dim();
        let area = (h * w) as f64;
        let (log_lo, log_hi) = (self.erase_ratio.0.ln(), self.erase_ratio.1.ln());

        for _ in 0..10 {
            let erase_area = area * rng.gen_range(self.erase_scale.0..=self.erase_scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();
            let eh = (erase_area * aspect).sqrt().round() as usize;
            let ew = (erase_area / aspect).sqrt().round() as usize;
            if eh == 0 || ew == 0 || eh >= h || ew >= w {
                continue;
            }
            let top = rng.gen_range(0..=h - eh);
            let left = rng.gen_range(0..=w - ew);
            pixels
                .slice_mut(s![.., top..top + eh, left..left + ew])
                .fill(0.0);
            return;
        }
    }
}

fn factor<R: Rng + ?Sized>(strength: f32, rng: &mut R) -> f32 {
    rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength)
}

/// `[H, W, 3]` bytes to `[3, H, W]` floats in `[0, 1]`.
pub fn to_chw(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    let mut out = Array3::<f32>::zeros((CHANNELS, h as usize, w as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..CHANNELS {
            out[[c, y as usize, x as usize]] = pixel.0[c] as f32 / 255.0;
        }
    }
    out
}

pub fn normalize(pixels: &mut Array3<f32>) {
    for (c, mut channel) in pixels.axis_iter_mut(Axis(0)).enumerate() {
        channel.mapv_inplace(|v| (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]);
    }
}

fn luminance(pixels: &Array3<f32>) -> Array2<f32> {
    let r = pixels.index_axis(Axis(0), 0);
    let g = pixels.index_axis(Axis(0), 1);
    let b = pixels.index_axis(Axis(0), 2);
    &r * 0.299 + &g * 0.587 + &b * 0.114
}

fn shift_hue(pixels: &mut Array3<f32>, shift: f32) {
    let (_, h, w) = pixels.dim();
    for y in 0..h {
        for x in 0..w {
            let rgb = [pixels[[0, y, x]], pixels[[1, y, x]], pixels[[2, y, x]]];
            let (hue, sat, val) = rgb_to_hsv(rgb);
            let out = hsv_to_rgb((hue + shift).rem_euclid(1.0), sat, val);
            for c in 0..CHANNELS {
                pixels[[c, y, x]] = out[c];
            }
        }
    }
}

fn rgb_to_hsv([r, g, b]: [f32; 3]) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return (0.0, 0.0, max);
    }
    let hue = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    (hue / 6.0, delta / max, max)
}

fn hsv_to_rgb(hue: f32, sat: f32, val: f32) -> [f32; 3] {
    let h6 = hue * 6.0;
    let sector = h6.floor();
    let frac = h6 - sector;
    let p = val * (1.0 - sat);
    let q = val * (1.0 - sat * frac);
    let t = val * (1.0 - sat * (1.0 - frac));
    match sector as i32 % 6 {
        0 => [val, t, p],
        1 => [q, val, p],
        2 => [p, val, t],
        3 => [p, q, val],
        4 => [t, p, val],
        _ => [val, p, q],
    }
}

/// Row-major 3x3 projective matrix acting on `(x, y, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3(pub [f32; 9]);

impl Mat3 {
    pub fn identity() -> Self {
        Mat3([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    pub fn translation(tx: f32, ty: f32) -> Self {
        Mat3([1.0, 0.0, tx, 0.0, 1.0, ty, 0.0, 0.0, 1.0])
    }

    pub fn rotation(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        Mat3([cos, -sin, 0.0, sin, cos, 0.0, 0.0, 0.0, 1.0])
    }

    pub fn shear_x(radians: f32) -> Self {
        Mat3([1.0, radians.tan(), 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    pub fn mul(&self, other: &Mat3) -> Mat3 {
        let (a, b) = (&self.0, &other.0);
        let mut out = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
            }
        }
        Mat3(out)
    }

    pub fn transform(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let m = &self.0;
        let z = m[6] * x + m[7] * y + m[8];
        if z.abs() < 1e-8 {
            return None;
        }
        Some((
            (m[0] * x + m[1] * y + m[2]) / z,
            (m[3] * x + m[4] * y + m[5]) / z,
        ))
    }

    pub fn invert(&self) -> Option<Mat3> {
        let m = &self.0;
        let cof = [
            m[4] * m[8] - m[5] * m[7],
            m[5] * m[6] - m[3] * m[8],
            m[3] * m[7] - m[4] * m[6],
        ];
        let det = m[0] * cof[0] + m[1] * cof[1] + m[2] * cof[2];
        if det.abs() < 1e-8 {
            return None;
        }
        let inv = [
            cof[0],
            m[2] * m[7] - m[1] * m[8],
            m[1] * m[5] - m[2] * m[4],
            cof[1],
            m[0] * m[8] - m[2] * m[6],
            m[2] * m[3] - m[0] * m[5],
            cof[2],
            m[1] * m[6] - m[0] * m[7],
            m[0] * m[4] - m[1] * m[3],
        ];
        Some(Mat3(inv.map(|v| v / det)))
    }

    /// Projective map sending each `from[i]` to `to[i]`.
    pub fn homography(from: &[[f32; 2]; 4], to: &[[f32; 2]; 4]) -> Option<Mat3> {
        let mut a = [[0f64; 9]; 8];
        for (i, (&[x, y], &[u, v])) in from.iter().zip(to).enumerate() {
            let (x, y, u, v) = (x as f64, y as f64, u as f64, v as f64);
            a[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
            a[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
        }

        // Gauss-Jordan with partial pivoting
        for col in 0..8 {
            let pivot = (col..8).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
            if a[pivot][col].abs() < 1e-12 {
                return None;
            }
            a.swap(col, pivot);
            let p = a[col][col];
            a[col].iter_mut().for_each(|v| *v /= p);
            for row in 0..8 {
                if row != col {
                    let f = a[row][col];
                    let pivot_row = a[col];
                    a[row]
                        .iter_mut()
                        .zip(pivot_row)
                        .for_each(|(v, pv)| *v -= f * pv);
                }
            }
        }

        let mut h = [1.0f32; 9];
        for (i, row) in a.iter().enumerate() {
            h[i] = row[8] as f32;
        }
        Some(Mat3(h))
    }
}

/// Resamples `image` through `inverse` (destination to source), black outside the source.
pub fn warp(image: &RgbImage, inverse: &Mat3) -> RgbImage {
    let (w, h) = image.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if let Some((sx, sy)) = inverse.transform(x as f32, y as f32) {
            *pixel = bilinear(image, sx, sy);
        }
    }
    out
}

fn bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = image.dimensions();
    if x < -0.5 || y < -0.5 || x > w as f32 - 0.5 || y > h as f32 - 0.5 {
        return Rgb([0, 0, 0]);
    }
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(rgb)))
    }

    #[test]
    fn eval_normalizes_a_flat_image() {
        let pixels = EvalTransform::for_size(32).apply(&solid(64, 48, [255, 0, 128]));
        assert_eq!(pixels.dim(), (3, 32, 32));

        let expected_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expected_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((pixels[[0, 10, 10]] - expected_r).abs() < 1e-4);
        assert!((pixels[[1, 31, 0]] - expected_g).abs() < 1e-4);
    }

    #[test]
    fn for_size_scales_the_resize_edge() {
        assert_eq!(EvalTransform::for_size(224), EvalTransform::new(255, 224));
        assert_eq!(EvalTransform::inference(), EvalTransform::new(256, 224));
    }

    #[test]
    fn train_output_has_requested_size() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let transform = TrainTransform::new(40);
        for _ in 0..5 {
            let pixels = transform.apply(&solid(90, 60, [10, 200, 30]), &mut rng);
            assert_eq!(pixels.dim(), (3, 40, 40));
            assert!(pixels.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn erasing_zeroes_a_rectangle() {
        let mut transform = TrainTransform::new(32);
        transform.erase_prob = 1.0;
        let mut pixels = Array3::<f32>::from_elem((3, 32, 32), 1.0);
        transform.random_erase(&mut pixels, &mut ChaCha8Rng::seed_from_u64(1));

        let zeros = pixels.iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 0);
        assert_eq!(zeros % 3, 0);
        assert!(zeros <= (3.0 * 32.0 * 32.0 * 0.15) as usize + 3 * 32);
    }

    #[test]
    fn hue_shift_by_a_third_turns_red_green() {
        let mut pixels = Array3::<f32>::zeros((3, 1, 1));
        pixels[[0, 0, 0]] = 1.0;
        shift_hue(&mut pixels, 1.0 / 3.0);
        assert!(pixels[[0, 0, 0]].abs() < 1e-4);
        assert!((pixels[[1, 0, 0]] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn homography_maps_corners() {
        let from = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
        let to = [[1.0, 2.0], [9.0, 0.5], [10.0, 9.0], [0.5, 10.0]];
        let h = Mat3::homography(&from, &to).unwrap();
        for (f, t) in from.iter().zip(&to) {
            let (x, y) = h.transform(f[0], f[1]).unwrap();
            assert!((x - t[0]).abs() < 1e-3 && (y - t[1]).abs() < 1e-3);
        }

        let round_trip = h.mul(&h.invert().unwrap());
        for (got, want) in round_trip.0.iter().zip(Mat3::identity().0) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn identity_warp_is_lossless() {
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(2, 1, Rgb([9, 8, 7]));
        assert_eq!(warp(&img, &Mat3::identity()), img);
    }
}
