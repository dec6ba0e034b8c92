//! Receptive-field geometry of a ConvCaps layer: which input capsules vote
//! for which output capsules, the votes themselves and the routing priors.
//!
//! Input capsules of a window are flattened as `Bkk = (b * K + ki) * K + kj`,
//! output capsules as `Cww = (c * out_h + oy) * out_w + ox`.

use ndarray::{Array2, Array3, Array6, ArrayView2, ArrayView3, ArrayView4};

use super::error::{CapsError, Result};

/// Output extent along one axis. A zero kernel spans the whole input.
pub fn output_extent(input: usize, kernel: usize, stride: usize) -> usize {
    if kernel == 0 || input < kernel {
        1
    } else {
        (input - kernel) / stride + 1
    }
}

/// Positional offsets `(ki / in_h, kj / in_w)` for every kernel position.
pub fn coordinate_offsets(in_h: usize, in_w: usize) -> Array3<f32> {
    Array3::from_shape_fn((in_h, in_w, 2), |(i, j, axis)| {
        if axis == 0 {
            i as f32 / in_h as f32
        } else {
            j as f32 / in_w as f32
        }
    })
}

#[derive(Debug, Clone)]
pub struct VoteGeometry {
    pub in_types: usize,
    pub out_types: usize,
    pub pose_size: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    pub out_h: usize,
    pub out_w: usize,
    /// Present when coordinate addition is enabled; `(kernel_h, kernel_w, 2)`.
    pub offsets: Option<Array3<f32>>,
}

impl VoteGeometry {
    pub fn new(
        in_types: usize,
        out_types: usize,
        pose_size: usize,
        kernel_size: usize,
        stride: usize,
        (in_h, in_w): (usize, usize),
        coordinate_add: bool,
    ) -> Result<Self> {
        if stride == 0 {
            return Err(CapsError::InvalidConfig("vote geometry: stride must be positive".to_string()));
        }
        let (kernel_h, kernel_w) = if kernel_size == 0 {
            (in_h, in_w)
        } else {
            (kernel_size, kernel_size)
        };
        if kernel_h > in_h || kernel_w > in_w {
            return Err(CapsError::shape(
                "vote geometry",
                format!("input of at least {kernel_h}x{kernel_w}"),
                format!("{in_h}x{in_w}"),
            ));
        }
        let offsets = coordinate_add.then(|| coordinate_offsets(in_h, in_w));

        Ok(Self {
            in_types,
            out_types,
            pose_size,
            in_h,
            in_w,
            kernel_h,
            kernel_w,
            stride,
            out_h: output_extent(in_h, kernel_size, stride),
            out_w: output_extent(in_w, kernel_size, stride),
            offsets,
        })
    }

    pub fn pose_dim(&self) -> usize {
        self.pose_size * self.pose_size
    }

    pub fn positions(&self) -> usize {
        self.out_h * self.out_w
    }

    /// Number of input capsules in one receptive field (`Bkk`).
    pub fn inputs_per_window(&self) -> usize {
        self.in_types * self.kernel_h * self.kernel_w
    }

    /// Number of output capsules across all positions (`Cww`).
    pub fn outputs(&self) -> usize {
        self.out_types * self.positions()
    }

    pub fn input_index(&self, b: usize, ki: usize, kj: usize) -> usize {
        (b * self.kernel_h + ki) * self.kernel_w + kj
    }

    pub fn output_index(&self, c: usize, oy: usize, ox: usize) -> usize {
        (c * self.out_h + oy) * self.out_w + ox
    }

    /// Output type of a flattened output index.
    pub fn output_type(&self, j: usize) -> usize {
        j / self.positions()
    }

    /// Transformation matrix for input type `b` at kernel offset `(ki, kj)`
    /// and output type `c`. Shared banks have a single offset.
    pub fn transform<'a>(&self, bank: &'a Array6<f32>, b: usize, ki: usize, kj: usize, c: usize) -> ArrayView2<'a, f32> {
        let (_, bank_h, bank_w, _, _, _) = bank.dim();
        let (ki, kj) = if bank_h == 1 && bank_w == 1 { (0, 0) } else { (ki, kj) };
        bank.slice(ndarray::s![b, ki, kj, c, .., ..])
    }

    /// Votes of one sample: `(Bkk, Cww, h*h)`.
    ///
    /// `poses` is `(in_types, in_h, in_w, h*h)`.
    pub fn votes(&self, poses: &ArrayView4<f32>, bank: &Array6<f32>) -> Array3<f32> {
        let h = self.pose_size;
        let mut votes = Array3::zeros((self.inputs_per_window(), self.outputs(), self.pose_dim()));

        for b in 0..self.in_types {
            for ki in 0..self.kernel_h {
                for kj in 0..self.kernel_w {
                    let i = self.input_index(b, ki, kj);
                    for c in 0..self.out_types {
                        let w = self.transform(bank, b, ki, kj, c);
                        for oy in 0..self.out_h {
                            for ox in 0..self.out_w {
                                let j = self.output_index(c, oy, ox);
                                let pose = poses.slice(ndarray::s![
                                    b,
                                    oy * self.stride + ki,
                                    ox * self.stride + kj,
                                    ..
                                ]);
                                for r in 0..h {
                                    for col in 0..h {
                                        let mut sum = 0.0;
                                        for k in 0..h {
                                            sum += w[[r, k]] * pose[k * h + col];
                                        }
                                        votes[[i, j, r * h + col]] = sum;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(offsets) = &self.offsets {
            self.add_coordinates(&mut votes, offsets);
        }
        votes
    }

    /// Adds the kernel position to the translation column of every vote.
    fn add_coordinates(&self, votes: &mut Array3<f32>, offsets: &Array3<f32>) {
        let h = self.pose_size;
        for b in 0..self.in_types {
            for ki in 0..self.kernel_h {
                for kj in 0..self.kernel_w {
                    let i = self.input_index(b, ki, kj);
                    for j in 0..self.outputs() {
                        votes[[i, j, h - 1]] += offsets[[ki, kj, 0]];
                        votes[[i, j, 2 * h - 1]] += offsets[[ki, kj, 1]];
                    }
                }
            }
        }
    }

    /// Removes what `add_coordinates` added, for back-projection.
    pub fn remove_coordinates(&self, vote: &mut [f32], ki: usize, kj: usize) {
        if let Some(offsets) = &self.offsets {
            let h = self.pose_size;
            vote[h - 1] -= offsets[[ki, kj, 0]];
            vote[2 * h - 1] -= offsets[[ki, kj, 1]];
        }
    }

    /// Input activations of every window tiled across the output types:
    /// `(Bkk, Cww)`. `activations` is `(in_types, in_h, in_w)`.
    pub fn priors(&self, activations: &ArrayView3<f32>) -> Array2<f32> {
        Array2::from_shape_fn((self.inputs_per_window(), self.outputs()), |(i, j)| {
            let b = i / (self.kernel_h * self.kernel_w);
            let ki = (i / self.kernel_w) % self.kernel_h;
            let kj = i % self.kernel_w;
            let pos = j % self.positions();
            let (oy, ox) = (pos / self.out_w, pos % self.out_w);
            activations[[b, oy * self.stride + ki, ox * self.stride + kj]]
        })
    }
}
