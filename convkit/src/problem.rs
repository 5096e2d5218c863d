//! Convolution problem description and size arithmetic.
//!
//! Layouts are fixed: input `N,C,spatial...`, weight `K,C/group,filter...`,
//! output `N,K,output...`, all densely packed. Spatial vectors are ordered
//! outermost first (`D,H,W`).

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};

/// Which convolution pass is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// output = conv(input, weight)
    Forward,
    /// input gradient from output gradient and weight
    BackwardData,
    /// weight gradient from input and output gradient
    BackwardWeight,
}

impl Direction {
    pub const ALL: [Direction; 3] = [
        Direction::Forward,
        Direction::BackwardData,
        Direction::BackwardWeight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "fwd",
            Self::BackwardData => "bwd",
            Self::BackwardWeight => "wrw",
        }
    }

    /// The tensor this direction writes.
    pub fn result_role(&self) -> TensorRole {
        match self {
            Self::Forward => TensorRole::Output,
            Self::BackwardData => TensorRole::Input,
            Self::BackwardWeight => TensorRole::Weight,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three tensors of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Input,
    Weight,
    Output,
}

impl TensorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Weight => "weight",
            Self::Output => "output",
        }
    }
}

/// Shape and parameters of one (possibly grouped) convolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvProblem {
    pub n: usize,
    pub c: usize,
    pub k: usize,
    pub group: usize,
    pub input_spatial: Vec<usize>,
    pub filter_spatial: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub left_pads: Vec<usize>,
    pub right_pads: Vec<usize>,
}

impl ConvProblem {
    /// Unit stride and dilation, no padding, one group.
    pub fn new(n: usize, c: usize, k: usize, input_spatial: &[usize], filter_spatial: &[usize]) -> Self {
        let rank = input_spatial.len();
        Self {
            n,
            c,
            k,
            group: 1,
            input_spatial: input_spatial.to_vec(),
            filter_spatial: filter_spatial.to_vec(),
            strides: vec![1; rank],
            dilations: vec![1; rank],
            left_pads: vec![0; rank],
            right_pads: vec![0; rank],
        }
    }

    pub fn new_2d(n: usize, c: usize, k: usize, hw: [usize; 2], yx: [usize; 2]) -> Self {
        Self::new(n, c, k, &hw, &yx)
    }

    pub fn new_3d(n: usize, c: usize, k: usize, dhw: [usize; 3], zyx: [usize; 3]) -> Self {
        Self::new(n, c, k, &dhw, &zyx)
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_strides(mut self, strides: &[usize]) -> Self {
        self.strides = strides.to_vec();
        self
    }

    pub fn with_dilations(mut self, dilations: &[usize]) -> Self {
        self.dilations = dilations.to_vec();
        self
    }

    /// Same padding on both sides.
    pub fn with_pads(mut self, pads: &[usize]) -> Self {
        self.left_pads = pads.to_vec();
        self.right_pads = pads.to_vec();
        self
    }

    pub fn with_left_pads(mut self, pads: &[usize]) -> Self {
        self.left_pads = pads.to_vec();
        self
    }

    pub fn with_right_pads(mut self, pads: &[usize]) -> Self {
        self.right_pads = pads.to_vec();
        self
    }

    pub fn spatial_rank(&self) -> usize {
        self.input_spatial.len()
    }

    pub fn c_per_group(&self) -> usize {
        self.c / self.group.max(1)
    }

    pub fn k_per_group(&self) -> usize {
        self.k / self.group.max(1)
    }

    /// Output extent per spatial axis; 0 where the dilated filter does not fit.
    pub fn output_spatial(&self) -> Vec<usize> {
        (0..self.spatial_rank())
            .map(|i| {
                let axis = |v: &[usize], default: usize| v.get(i).copied().unwrap_or(default);
                let padded =
                    self.input_spatial[i] + axis(&self.left_pads, 0) + axis(&self.right_pads, 0);
                let window =
                    axis(&self.dilations, 1) * axis(&self.filter_spatial, 1).saturating_sub(1) + 1;
                padded
                    .checked_sub(window)
                    .map_or(0, |span| span / axis(&self.strides, 1).max(1) + 1)
            })
            .collect()
    }

    /// `[N, C, spatial...]`
    pub fn input_lengths(&self) -> Vec<usize> {
        [self.n, self.c].into_iter().chain(self.input_spatial.iter().copied()).collect()
    }

    /// `[K, C/group, filter...]`
    pub fn weight_lengths(&self) -> Vec<usize> {
        [self.k, self.c_per_group()]
            .into_iter()
            .chain(self.filter_spatial.iter().copied())
            .collect()
    }

    /// `[N, K, output...]`
    pub fn output_lengths(&self) -> Vec<usize> {
        [self.n, self.k].into_iter().chain(self.output_spatial()).collect()
    }

    pub fn lengths(&self, role: TensorRole) -> Vec<usize> {
        match role {
            TensorRole::Input => self.input_lengths(),
            TensorRole::Weight => self.weight_lengths(),
            TensorRole::Output => self.output_lengths(),
        }
    }

    pub fn input_len(&self) -> usize {
        self.input_lengths().iter().product()
    }

    pub fn weight_len(&self) -> usize {
        self.weight_lengths().iter().product()
    }

    pub fn output_len(&self) -> usize {
        self.output_lengths().iter().product()
    }

    pub fn len_of(&self, role: TensorRole) -> usize {
        self.lengths(role).iter().product()
    }

    /// Reject problems the kernels cannot run.
    pub fn validate(&self) -> Result<()> {
        let rank = self.spatial_rank();
        if !(1..=3).contains(&rank) {
            return Err(ConvError::InvalidProblem(format!(
                "{rank} spatial dimensions, expected 1 to 3"
            )));
        }
        let per_axis = [
            ("filter", &self.filter_spatial),
            ("stride", &self.strides),
            ("dilation", &self.dilations),
            ("left pad", &self.left_pads),
            ("right pad", &self.right_pads),
        ];
        for (name, values) in per_axis {
            if values.len() != rank {
                return Err(ConvError::InvalidProblem(format!(
                    "{name} has {} entries for {rank} spatial dimensions",
                    values.len()
                )));
            }
        }
        for (name, value) in [("n", self.n), ("c", self.c), ("k", self.k), ("group", self.group)] {
            if value == 0 {
                return Err(ConvError::InvalidProblem(format!("{name} must be positive")));
            }
        }
        for (name, values) in [
            ("input", &self.input_spatial),
            ("filter", &self.filter_spatial),
            ("stride", &self.strides),
            ("dilation", &self.dilations),
        ] {
            if values.contains(&0) {
                return Err(ConvError::InvalidProblem(format!(
                    "{name} extents must be positive, got {values:?}"
                )));
            }
        }
        if self.c % self.group != 0 || self.k % self.group != 0 {
            return Err(ConvError::InvalidProblem(format!(
                "group {} does not divide c={} and k={}",
                self.group, self.c, self.k
            )));
        }
        if self.output_spatial().contains(&0) {
            return Err(ConvError::InvalidProblem(format!(
                "dilated filter {:?} does not fit padded input {:?}",
                self.filter_spatial, self.input_spatial
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ConvProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} c={} k={} g={} in={:?} fil={:?} s={:?} d={:?} lp={:?} rp={:?}",
            self.n,
            self.c,
            self.k,
            self.group,
            self.input_spatial,
            self.filter_spatial,
            self.strides,
            self.dilations,
            self.left_pads,
            self.right_pads
        )
    }
}
