//! Patch extraction ("unfold", im2col) and its adjoint ("fold", col2im)
//!
//! `unfold` turns one `[C, H, W]` sample into a `[C * kh * kw, L]` matrix whose columns
//! are the receptive fields of the `L = out_h * out_w` output positions. With the kernel
//! viewed as a `[C_out, C * kh * kw]` matrix, a convolution becomes a plain matrix
//! product. `fold` scatters columns back, summing overlaps, and is the exact transpose of
//! `unfold`.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

/// Shape parameters of a 2D convolution with respect to one input sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
}

impl ConvGeometry {
    /// Output height: `(H + 2p - d(k-1) - 1) / s + 1`.
    pub fn out_height(&self) -> usize {
        Self::out_dim(self.height, self.kernel.0, self.stride.0, self.padding.0, self.dilation.0)
    }

    /// Output width: `(W + 2p - d(k-1) - 1) / s + 1`.
    pub fn out_width(&self) -> usize {
        Self::out_dim(self.width, self.kernel.1, self.stride.1, self.padding.1, self.dilation.1)
    }

    /// Number of output positions `L`.
    pub fn num_patches(&self) -> usize {
        self.out_height() * self.out_width()
    }

    /// Rows of the unfolded matrix: `C * kh * kw`.
    pub fn patch_size(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    fn out_dim(
        size: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
    ) -> usize {
        let span = dilation * (kernel - 1) + 1;
        let padded = size + 2 * padding;
        if padded < span {
            0
        } else {
            (padded - span) / stride + 1
        }
    }

    /// Input coordinate read by kernel tap `k` at output position `o`, or `None` in padding.
    #[inline]
    pub(crate) fn source(&self, axis: usize, o: usize, k: usize) -> Option<usize> {
        let (stride, padding, dilation, limit) = if axis == 0 {
            (self.stride.0, self.padding.0, self.dilation.0, self.height)
        } else {
            (self.stride.1, self.padding.1, self.dilation.1, self.width)
        };
        let pos = (o * stride + k * dilation) as isize - padding as isize;
        if pos < 0 || pos as usize >= limit {
            None
        } else {
            Some(pos as usize)
        }
    }
}

/// Extract the receptive-field columns of one sample `[C, H, W]` → `[C * kh * kw, L]`.
pub fn unfold(input: &ArrayView3<'_, f64>, geom: &ConvGeometry) -> Array2<f64> {
    let (kh, kw) = geom.kernel;
    let (oh, ow) = (geom.out_height(), geom.out_width());
    let mut cols = Array2::zeros((geom.patch_size(), oh * ow));
    for c in 0..geom.in_channels {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (c * kh + ki) * kw + kj;
                for i in 0..oh {
                    let Some(h) = geom.source(0, i, ki) else { continue };
                    for j in 0..ow {
                        if let Some(w) = geom.source(1, j, kj) {
                            cols[[row, i * ow + j]] = input[[c, h, w]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Scatter-add columns `[C * kh * kw, L]` back into one sample `[C, H, W]`.
pub fn fold(cols: &ArrayView2<'_, f64>, geom: &ConvGeometry) -> Array3<f64> {
    let (kh, kw) = geom.kernel;
    let (oh, ow) = (geom.out_height(), geom.out_width());
    let mut out = Array3::zeros((geom.in_channels, geom.height, geom.width));
    for c in 0..geom.in_channels {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (c * kh + ki) * kw + kj;
                for i in 0..oh {
                    let Some(h) = geom.source(0, i, ki) else { continue };
                    for j in 0..ow {
                        if let Some(w) = geom.source(1, j, kj) {
                            out[[c, h, w]] += cols[[row, i * ow + j]];
                        }
                    }
                }
            }
        }
    }
    out
}
