//! Shadow falloff precomputation.
//!
//! A drop shadow is a gaussian-blurred solid rectangle. Because the
//! gaussian is separable, the blurred alpha at any pixel factors into
//! horizontal and vertical coverage terms; for windows larger than the
//! kernel those terms only vary near the edges. We therefore
//! precompute one corner tile and one edge strip per (radius, opacity)
//! configuration and assemble each window's shadow image from them,
//! instead of re-running the convolution per window per frame.

use crate::config::ShadowConfig;
use crate::geometry::Rect;

/// Precomputed falloff tables for one shadow configuration.
#[derive(Debug, Clone)]
pub struct ShadowTables {
    radius: i32,
    opacity: f64,
    /// Gaussian diameter: the shadow image is the window grown by this
    /// much in each dimension.
    d: i32,
    /// Corner alpha tile, (d+1) x (d+1), row-major.
    corner: Vec<u8>,
    /// Edge strip alpha, length d+1.
    top: Vec<u8>,
}

impl ShadowTables {
    pub fn build(config: &ShadowConfig) -> Self {
        let radius = config.radius.max(0);
        let opacity = config.opacity.clamp(0.0, 1.0);
        let d = 2 * radius;
        let kernel = gaussian_kernel(radius);

        // edge[x]: fraction of kernel weight overlapping the window
        // when the shadow pixel sits x pixels in from the edge, for a
        // window at least d wide.
        let mut edge = Vec::with_capacity(d as usize + 1);
        for x in 0..=d {
            let mut sum = 0.0;
            for j in -radius..=radius {
                // Window column hit by kernel sample j; in range when
                // >= 0 (the far edge is beyond the kernel by premise).
                if x - radius + j >= 0 {
                    sum += kernel[(j + radius) as usize];
                }
            }
            edge.push(sum);
        }

        let to_alpha = |v: f64| (v * opacity * 255.0).round().clamp(0.0, 255.0) as u8;
        let top: Vec<u8> = edge.iter().map(|&c| to_alpha(c)).collect();
        let mut corner = Vec::with_capacity(((d + 1) * (d + 1)) as usize);
        for y in 0..=d {
            for x in 0..=d {
                corner.push(to_alpha(edge[x as usize] * edge[y as usize]));
            }
        }

        Self {
            radius,
            opacity,
            d,
            corner,
            top,
        }
    }

    /// True when the tables were built from an equivalent configuration;
    /// rebuilding is only needed when this returns false.
    pub fn matches(&self, config: &ShadowConfig) -> bool {
        self.radius == config.radius.max(0)
            && (self.opacity - config.opacity.clamp(0.0, 1.0)).abs() < f64::EPSILON
    }

    /// Size of the shadow image for a window of the given size.
    pub fn image_size(&self, width: u32, height: u32) -> (u32, u32) {
        (width + self.d as u32, height + self.d as u32)
    }

    /// On-screen placement of a window's shadow image: the window
    /// origin shifted by the configured offset. The offset is expected
    /// to already account for the blur growth, matching the extents
    /// that get damaged when the window moves.
    pub fn placement(&self, bounds: &Rect, config: &ShadowConfig) -> Rect {
        let (sw, sh) = self.image_size(bounds.width().max(0) as u32, bounds.height().max(0) as u32);
        Rect::from_xywh(
            bounds.x1 + config.offset_x,
            bounds.y1 + config.offset_y,
            sw,
            sh,
        )
    }

    /// Assemble the alpha map of a window's shadow. Row-major A8,
    /// dimensions given by [`ShadowTables::image_size`].
    pub fn image(&self, width: u32, height: u32) -> Vec<u8> {
        let (sw, sh) = self.image_size(width, height);
        let (sw, sh) = (sw as i32, sh as i32);
        let large = width as i32 > self.d && height as i32 > self.d;
        let mut out = vec![0u8; (sw * sh) as usize];

        if large {
            // Fast path: stitch corner tiles, edge strips, and a
            // constant-alpha center.
            let d = self.d;
            let stride = (d + 1) as usize;
            let center = self.top[d as usize];
            for y in 0..sh {
                let yi = y.min(sh - 1 - y).min(d) as usize;
                for x in 0..sw {
                    let xi = x.min(sw - 1 - x).min(d) as usize;
                    let v = if xi < d as usize && yi < d as usize {
                        self.corner[yi * stride + xi]
                    } else if xi < d as usize {
                        self.top[xi]
                    } else if yi < d as usize {
                        self.top[yi]
                    } else {
                        center
                    };
                    out[(y * sw + x) as usize] = v;
                }
            }
        } else {
            // Windows smaller than the kernel: the two edges interact,
            // compute exact coverage per axis.
            let cx = self.coverage(width as i32, sw);
            let cy = self.coverage(height as i32, sh);
            for y in 0..sh {
                for x in 0..sw {
                    let v = cx[x as usize] * cy[y as usize] * self.opacity * 255.0;
                    out[(y * sw + x) as usize] = v.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        out
    }

    /// Exact 1D kernel coverage of a `len`-wide window for every shadow
    /// pixel along an `out_len`-wide axis.
    fn coverage(&self, len: i32, out_len: i32) -> Vec<f64> {
        let kernel = gaussian_kernel(self.radius);
        let r = self.radius;
        (0..out_len)
            .map(|x| {
                let mut sum = 0.0;
                for j in -r..=r {
                    let col = x - r + j;
                    if col >= 0 && col < len {
                        sum += kernel[(j + r) as usize];
                    }
                }
                sum
            })
            .collect()
    }
}

/// Normalized 1D gaussian, length 2*radius+1, sigma tied to radius.
fn gaussian_kernel(radius: i32) -> Vec<f64> {
    if radius == 0 {
        return vec![1.0];
    }
    let sigma = radius as f64 / 2.0;
    let denom = 2.0 * sigma * sigma;
    let mut weights: Vec<f64> = (-radius..=radius)
        .map(|i| {
            let x = i as f64;
            (-x * x / denom).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= sum;
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(radius: i32, opacity: f64) -> ShadowConfig {
        ShadowConfig {
            radius,
            opacity,
            ..ShadowConfig::default()
        }
    }

    #[test]
    fn test_image_dimensions() {
        let tables = ShadowTables::build(&config(12, 1.0));
        assert_eq!(tables.image_size(200, 200), (224, 224));
        let img = tables.image(200, 200);
        assert_eq!(img.len(), 224 * 224);
    }

    #[test]
    fn test_center_saturates_and_corners_fall_off() {
        let tables = ShadowTables::build(&config(12, 1.0));
        let (sw, sh) = tables.image_size(200, 200);
        let img = tables.image(200, 200);
        let at = |x: u32, y: u32| img[(y * sw + x) as usize];

        let center = at(sw / 2, sh / 2);
        assert!(center > 250, "center should be nearly opaque, got {center}");
        let corner = at(0, 0);
        assert!(corner < 10, "far corner should be nearly transparent, got {corner}");
        // Monotonic along the diagonal into the window.
        let mut last = 0u8;
        for i in 0..=24u32 {
            let v = at(i, i);
            assert!(v >= last, "falloff must be monotonic");
            last = v;
        }
    }

    #[test]
    fn test_opacity_scales_alpha() {
        let full = ShadowTables::build(&config(8, 1.0));
        let half = ShadowTables::build(&config(8, 0.5));
        let (sw, sh) = full.image_size(100, 100);
        let a = full.image(100, 100)[(sh / 2 * sw + sw / 2) as usize];
        let b = half.image(100, 100)[(sh / 2 * sw + sw / 2) as usize];
        assert!((a as i32 - 2 * b as i32).abs() <= 2);
    }

    #[test]
    fn test_small_window_exact_path() {
        // Window smaller than the kernel diameter.
        let tables = ShadowTables::build(&config(12, 1.0));
        let img = tables.image(10, 10);
        let (sw, sh) = tables.image_size(10, 10);
        assert_eq!(img.len(), (sw * sh) as usize);
        // A tiny window can never reach full shadow strength.
        assert!(img.iter().all(|&v| v < 255));
        // Symmetric in both axes.
        let at = |x: u32, y: u32| img[(y * sw + x) as usize];
        for y in 0..sh {
            for x in 0..sw {
                assert_eq!(at(x, y), at(sw - 1 - x, y));
                assert_eq!(at(x, y), at(x, sh - 1 - y));
            }
        }
    }

    #[test]
    fn test_rebuild_keyed_on_config() {
        let tables = ShadowTables::build(&config(12, 0.75));
        assert!(tables.matches(&config(12, 0.75)));
        assert!(!tables.matches(&config(13, 0.75)));
        assert!(!tables.matches(&config(12, 0.5)));
    }

    #[test]
    fn test_zero_radius() {
        let tables = ShadowTables::build(&config(0, 1.0));
        assert_eq!(tables.image_size(50, 50), (50, 50));
        let img = tables.image(50, 50);
        assert!(img.iter().all(|&v| v == 255));
    }
}
