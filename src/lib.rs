//! Iterative K-means clustering over a mesh of independent compute units.
//!
//! The dataset is split into near-equal contiguous shards, one per unit.
//! Each unit streams its shard through a small capacity-bounded scratch
//! buffer, assigns points to their nearest centroid across several
//! concurrent lanes, and reduces the lane accumulators into a single
//! partial result. The coordinating host merges the partials, recomputes
//! the global centroids, and repeats until the centroid shift drops below
//! the configured threshold or the iteration cap is reached.

use csv::ReaderBuilder;
use ndarray::{s, Array2, ArrayView2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::mem;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Dense host-side data representation (rows = points, columns = features).
pub type DataMatrix = Array2<f64>;

/// Upper bound (exclusive) for generated feature values.
pub const FEATURE_RANGE: f64 = 99.0;

/// Error type used by operations in this crate.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("bulk transfer failed: {0}")]
    Transfer(String),
    #[error("scratch capacity violation: {0}")]
    CapacityViolation(String),
    #[error("degenerate assignment: {0}")]
    DegenerateAssignment(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Arithmetic flavour used by the kernels and the centroid update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NumericMode {
    /// Floating-point features and sums, ordinary floating division.
    #[default]
    Real,
    /// 16-bit integer features, 64-bit integer sums, truncating division.
    #[serde(alias = "int16")]
    Quantized,
}

impl fmt::Display for NumericMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericMode::Real => write!(f, "real"),
            NumericMode::Quantized => write!(f, "quantized"),
        }
    }
}

impl std::str::FromStr for NumericMode {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "real" => Ok(Self::Real),
            "quantized" | "int16" => Ok(Self::Quantized),
            other => Err(MeshError::InvalidConfig(format!(
                "unsupported numeric mode '{other}'"
            ))),
        }
    }
}

/// Configurable knobs for a clustering run.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MeshConfig {
    /// Total number of points across all units.
    pub n_points: usize,
    /// Dimensionality of every point and centroid.
    pub n_features: usize,
    /// Number of centroids to optimise.
    pub n_clusters: usize,
    /// Number of compute units the dataset is partitioned over.
    pub n_units: usize,
    /// Concurrent lanes inside each unit.
    pub n_lanes_per_unit: usize,
    /// Stop once the centroid shift falls to or below this value.
    pub convergence_threshold: f64,
    /// Hard upper bound on iterations.
    pub max_iterations: usize,
    /// Arithmetic flavour for kernels and centroid updates.
    pub numeric_mode: NumericMode,
    /// Byte budget of each lane's scratch buffer.
    pub scratch_capacity_bytes: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            n_points: 1024,
            n_features: 2,
            n_clusters: 5,
            n_units: 8,
            n_lanes_per_unit: 8,
            convergence_threshold: 1e-2,
            max_iterations: 20,
            numeric_mode: NumericMode::default(),
            scratch_capacity_bytes: 4096,
        }
    }
}

impl MeshConfig {
    /// Validate configuration parameters before any memory is committed.
    pub fn validate(&self) -> Result<()> {
        if self.n_points == 0 {
            return Err(MeshError::InvalidConfig(
                "n_points must be greater than zero".into(),
            ));
        }
        if self.n_features == 0 {
            return Err(MeshError::InvalidConfig(
                "n_features must be greater than zero".into(),
            ));
        }
        if self.n_clusters == 0 {
            return Err(MeshError::InvalidConfig(
                "n_clusters must be greater than zero".into(),
            ));
        }
        if self.n_units == 0 {
            return Err(MeshError::InvalidConfig(
                "n_units must be greater than zero".into(),
            ));
        }
        if self.n_lanes_per_unit == 0 {
            return Err(MeshError::InvalidConfig(
                "n_lanes_per_unit must be greater than zero".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(MeshError::InvalidConfig(
                "max_iterations must be greater than zero".into(),
            ));
        }
        if !self.convergence_threshold.is_finite() || self.convergence_threshold < 0.0 {
            return Err(MeshError::InvalidConfig(
                "convergence_threshold must be finite and non-negative".into(),
            ));
        }
        if self.scratch_capacity_bytes == 0 {
            return Err(MeshError::CapacityViolation(
                "scratch_capacity_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Arithmetic policy implemented by each [`NumericMode`].
///
/// A single kernel is generic over this trait; the policy fixes the feature
/// representation, the width sums accumulate in, the ordered distance type,
/// and the division used by the centroid update.
pub trait NumericPolicy:
    fmt::Debug + Copy + Default + PartialEq + Send + Sync + 'static
{
    type Feature: Copy + Default + PartialEq + fmt::Debug + Send + Sync;
    type Sum: Copy + Default + PartialEq + fmt::Debug + Send + Sync;
    type Distance: Copy + PartialOrd;

    const MODE: NumericMode;

    fn feature_bytes() -> usize {
        mem::size_of::<Self::Feature>()
    }

    /// Squared Euclidean distance between a point and a centroid.
    fn squared_distance(a: &[Self::Feature], b: &[Self::Feature]) -> Self::Distance;

    /// Add one point into a cluster's feature sums.
    fn accumulate(sums: &mut [Self::Sum], point: &[Self::Feature]);

    /// Componentwise `into += from` over two sum slices.
    fn merge_sums(into: &mut [Self::Sum], from: &[Self::Sum]);

    /// Divide an accumulated sum by a cluster population.
    fn mean(sum: Self::Sum, count: u64) -> Self::Feature;

    fn feature_to_f64(value: Self::Feature) -> f64;
}

/// Floating-point arithmetic: `f64` features and sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealPolicy;

impl NumericPolicy for RealPolicy {
    type Feature = f64;
    type Sum = f64;
    type Distance = f64;

    const MODE: NumericMode = NumericMode::Real;

    fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| {
                let diff = x - y;
                diff * diff
            })
            .sum()
    }

    fn accumulate(sums: &mut [f64], point: &[f64]) {
        for (sum, value) in sums.iter_mut().zip(point.iter()) {
            *sum += value;
        }
    }

    fn merge_sums(into: &mut [f64], from: &[f64]) {
        for (acc, value) in into.iter_mut().zip(from.iter()) {
            *acc += value;
        }
    }

    fn mean(sum: f64, count: u64) -> f64 {
        sum / count as f64
    }

    fn feature_to_f64(value: f64) -> f64 {
        value
    }
}

/// Fixed-point arithmetic: `i16` features, `i64` sums, exact `i64`
/// distances, truncating division on the centroid update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantizedPolicy;

impl NumericPolicy for QuantizedPolicy {
    type Feature = i16;
    type Sum = i64;
    type Distance = i64;

    const MODE: NumericMode = NumericMode::Quantized;

    fn squared_distance(a: &[i16], b: &[i16]) -> i64 {
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| {
                let diff = i64::from(x) - i64::from(y);
                diff * diff
            })
            .sum()
    }

    fn accumulate(sums: &mut [i64], point: &[i16]) {
        for (sum, &value) in sums.iter_mut().zip(point.iter()) {
            *sum += i64::from(value);
        }
    }

    fn merge_sums(into: &mut [i64], from: &[i64]) {
        for (acc, value) in into.iter_mut().zip(from.iter()) {
            *acc += value;
        }
    }

    fn mean(sum: i64, count: u64) -> i16 {
        // Truncation toward zero, matching the fixed-point trajectory.
        (sum / count as i64) as i16
    }

    fn feature_to_f64(value: i16) -> f64 {
        f64::from(value)
    }
}

/// Policy-specific startup checks run before any unit is loaded.
fn validate_policy<P: NumericPolicy>(config: &MeshConfig) -> Result<()> {
    if P::MODE != config.numeric_mode {
        return Err(MeshError::InvalidConfig(format!(
            "numeric policy is {}, but the configuration selects {}",
            P::MODE,
            config.numeric_mode
        )));
    }
    scratch_points::<P>(config.scratch_capacity_bytes, config.n_features)?;
    if P::MODE == NumericMode::Quantized {
        let worst_case = config.n_points as u128 * i16::MAX as u128;
        if worst_case > i64::MAX as u128 {
            return Err(MeshError::InvalidConfig(format!(
                "quantized sums over {} points could overflow an i64 accumulator",
                config.n_points
            )));
        }
    }
    Ok(())
}

/// Number of whole points a scratch budget can stage at once.
fn scratch_points<P: NumericPolicy>(capacity_bytes: usize, n_features: usize) -> Result<usize> {
    let point_bytes = n_features * P::feature_bytes();
    let capacity = if point_bytes == 0 {
        0
    } else {
        capacity_bytes / point_bytes
    };
    if capacity == 0 {
        return Err(MeshError::CapacityViolation(format!(
            "scratch budget of {capacity_bytes} bytes cannot stage a single \
             {n_features}-feature point of {point_bytes} bytes"
        )));
    }
    Ok(capacity)
}

/// A contiguous slice of the point index space assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Unit index, or lane index when a shard is split across lanes.
    pub id: usize,
    /// First point of the range.
    pub offset: usize,
    /// Number of points in the range.
    pub count: usize,
}

/// Split `n` points into `parts` near-equal contiguous ranges.
///
/// The first `n % parts` ranges receive one extra point, so any two ranges
/// differ in size by at most one and together they cover `[0, n)` exactly
/// once. The same split is used for units and for lanes inside a unit.
pub fn partition(n: usize, parts: usize) -> Result<Vec<Partition>> {
    if parts == 0 {
        return Err(MeshError::InvalidConfig(
            "cannot partition points across zero workers".into(),
        ));
    }
    let base = n / parts;
    let remainder = n % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut offset = 0;
    for id in 0..parts {
        let count = base + usize::from(id < remainder);
        ranges.push(Partition { id, offset, count });
        offset += count;
    }
    Ok(ranges)
}

/// Per-lane staging area for one batch of points.
///
/// Holds at most `capacity_points` rows; the capacity is derived from the
/// configured byte budget and checked once at startup.
#[derive(Debug)]
pub struct ScratchBuffer<P: NumericPolicy> {
    staged: Vec<P::Feature>,
    capacity_points: usize,
    n_features: usize,
    len: usize,
}

impl<P: NumericPolicy> ScratchBuffer<P> {
    pub fn for_run(capacity_bytes: usize, n_features: usize) -> Result<Self> {
        let capacity_points = scratch_points::<P>(capacity_bytes, n_features)?;
        Ok(Self {
            staged: vec![P::Feature::default(); capacity_points * n_features],
            capacity_points,
            n_features,
            len: 0,
        })
    }

    pub fn capacity_points(&self) -> usize {
        self.capacity_points
    }

    /// Iterate over the points staged by the last transfer.
    fn points(&self) -> impl Iterator<Item = &[P::Feature]> + '_ {
        self.staged[..self.len * self.n_features].chunks_exact(self.n_features)
    }
}

/// A unit's shard of the dataset, resident in bulk memory.
///
/// Loaded once at setup and read-only afterwards; all reads go through
/// [`PointStore::read_batch`], which stages a bounded number of contiguous
/// points into a scratch buffer.
pub struct PointStore<P: NumericPolicy> {
    features: Vec<P::Feature>,
    n_points: usize,
    n_features: usize,
}

impl<P: NumericPolicy> PointStore<P> {
    fn load(shard: ArrayView2<'_, P::Feature>) -> Self {
        Self {
            features: shard.iter().copied().collect(),
            n_points: shard.nrows(),
            n_features: shard.ncols(),
        }
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Transfer `min(scratch capacity, want)` points starting at `offset`
    /// into the scratch buffer, returning how many were staged.
    pub fn read_batch(
        &self,
        offset: usize,
        want: usize,
        scratch: &mut ScratchBuffer<P>,
    ) -> Result<usize> {
        let staged = want.min(scratch.capacity_points);
        let end = offset
            .checked_add(staged)
            .filter(|&end| end <= self.n_points)
            .ok_or_else(|| {
                MeshError::Transfer(format!(
                    "batch read of {staged} points at offset {offset} exceeds a \
                     {}-point store",
                    self.n_points
                ))
            })?;
        let src = &self.features[offset * self.n_features..end * self.n_features];
        scratch.staged[..src.len()].copy_from_slice(src);
        scratch.len = staged;
        Ok(staged)
    }
}

/// Per-cluster feature sums and populations.
///
/// Lane-private while a kernel runs; the post-barrier merge folds lane
/// instances into the unit-level partial result, and the host folds unit
/// partials into the global accumulator. Always starts zeroed, so no state
/// leaks between iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAccumulator<P: NumericPolicy> {
    sums: Vec<P::Sum>,
    counts: Vec<u64>,
    n_features: usize,
}

impl<P: NumericPolicy> ClusterAccumulator<P> {
    pub fn zeroed(n_clusters: usize, n_features: usize) -> Self {
        Self {
            sums: vec![P::Sum::default(); n_clusters * n_features],
            counts: vec![0; n_clusters],
            n_features,
        }
    }

    fn record(&mut self, cluster: usize, point: &[P::Feature]) {
        self.counts[cluster] += 1;
        let start = cluster * self.n_features;
        P::accumulate(&mut self.sums[start..start + self.n_features], point);
    }

    /// Componentwise `self += other`.
    pub fn merge(&mut self, other: &Self) {
        P::merge_sums(&mut self.sums, &other.sums);
        for (into, from) in self.counts.iter_mut().zip(other.counts.iter()) {
            *into += from;
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn sums(&self) -> &[P::Sum] {
        &self.sums
    }

    pub fn total_count(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Index of the nearest centroid; the lowest index wins exact ties.
fn nearest_centroid<P: NumericPolicy>(
    point: &[P::Feature],
    centroids: &[P::Feature],
    n_features: usize,
) -> Result<usize> {
    let mut best: Option<(usize, P::Distance)> = None;
    for (cluster, centroid) in centroids.chunks_exact(n_features).enumerate() {
        let distance = P::squared_distance(point, centroid);
        match best {
            Some((_, lowest)) if !(distance < lowest) => {}
            _ => best = Some((cluster, distance)),
        }
    }
    best.map(|(cluster, _)| cluster).ok_or_else(|| {
        MeshError::DegenerateAssignment(
            "no valid nearest centroid: the centroid matrix is empty".into(),
        )
    })
}

/// One independently scheduled compute unit.
///
/// Owns a shard of the dataset in bulk memory plus a small fast-memory
/// replica of the centroid matrix that the coordinator rewrites before every
/// dispatch.
pub struct ComputeUnit<P: NumericPolicy> {
    id: usize,
    store: PointStore<P>,
    centroids: Vec<P::Feature>,
    n_features: usize,
    n_clusters: usize,
    n_lanes: usize,
    scratch_capacity_bytes: usize,
}

impl<P: NumericPolicy> ComputeUnit<P> {
    /// One-time load of the unit's assigned shard into its bulk store.
    pub fn load(id: usize, shard: ArrayView2<'_, P::Feature>, config: &MeshConfig) -> Result<Self> {
        if shard.ncols() != config.n_features {
            return Err(MeshError::Transfer(format!(
                "unit {id} received a shard of width {}, expected {}",
                shard.ncols(),
                config.n_features
            )));
        }
        scratch_points::<P>(config.scratch_capacity_bytes, config.n_features)?;
        Ok(Self {
            id,
            store: PointStore::load(shard),
            centroids: Vec::new(),
            n_features: config.n_features,
            n_clusters: config.n_clusters,
            n_lanes: config.n_lanes_per_unit,
            scratch_capacity_bytes: config.scratch_capacity_bytes,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn n_points(&self) -> usize {
        self.store.n_points()
    }

    /// Per-iteration write of the full centroid matrix into fast memory.
    pub fn write_centroids(&mut self, matrix: &[P::Feature]) -> Result<()> {
        if matrix.len() != self.n_clusters * self.n_features {
            return Err(MeshError::DegenerateAssignment(format!(
                "unit {} received a malformed centroid matrix of {} values, \
                 expected {}",
                self.id,
                matrix.len(),
                self.n_clusters * self.n_features
            )));
        }
        self.centroids.clear();
        self.centroids.extend_from_slice(matrix);
        Ok(())
    }

    /// Run the kernel over the whole shard and return the unit's partial
    /// result.
    ///
    /// The shard is split across lanes with the same balanced partitioning
    /// used for units. Lanes run concurrently into private accumulators; the
    /// parallel collect is the barrier, and the post-barrier merge folds the
    /// lane accumulators in increasing lane-id order.
    pub fn execute(&self) -> Result<ClusterAccumulator<P>> {
        if self.n_clusters == 0 || self.centroids.len() != self.n_clusters * self.n_features {
            return Err(MeshError::DegenerateAssignment(format!(
                "unit {} dispatched without a complete centroid matrix",
                self.id
            )));
        }
        let lanes = partition(self.store.n_points(), self.n_lanes)?;
        let lane_results: Vec<ClusterAccumulator<P>> = lanes
            .par_iter()
            .map(|lane| {
                let mut scratch =
                    ScratchBuffer::<P>::for_run(self.scratch_capacity_bytes, self.n_features)?;
                self.lane_pass(lane, &mut scratch)
            })
            .collect::<Result<_>>()?;

        let mut merged = ClusterAccumulator::zeroed(self.n_clusters, self.n_features);
        for lane_result in &lane_results {
            merged.merge(lane_result);
        }
        Ok(merged)
    }

    /// Batch loop for one lane's sub-range of the shard.
    fn lane_pass(
        &self,
        lane: &Partition,
        scratch: &mut ScratchBuffer<P>,
    ) -> Result<ClusterAccumulator<P>> {
        let mut accumulator = ClusterAccumulator::zeroed(self.n_clusters, self.n_features);
        let end = lane.offset + lane.count;
        let mut cursor = lane.offset;
        while cursor < end {
            let staged = self.store.read_batch(cursor, end - cursor, scratch)?;
            for point in scratch.points() {
                let cluster = nearest_centroid::<P>(point, &self.centroids, self.n_features)?;
                accumulator.record(cluster, point);
            }
            cursor += staged;
        }
        Ok(accumulator)
    }
}

/// Fold per-unit partial results into one global accumulator.
pub fn aggregate<P: NumericPolicy>(
    partials: &[ClusterAccumulator<P>],
    n_clusters: usize,
    n_features: usize,
) -> ClusterAccumulator<P> {
    let mut global = ClusterAccumulator::zeroed(n_clusters, n_features);
    for partial in partials {
        global.merge(partial);
    }
    global
}

/// Recompute centroids from a global accumulator, returning the shift.
///
/// A cluster with no members keeps its previous centroid. The shift is the
/// Euclidean norm of the difference between the old and new matrices,
/// always measured in `f64`.
pub fn update_centroids<P: NumericPolicy>(
    centroids: &mut [P::Feature],
    global: &ClusterAccumulator<P>,
) -> f64 {
    let n_features = global.n_features;
    let mut shift_squared = 0.0;
    for (cluster, &count) in global.counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        for feature in 0..n_features {
            let index = cluster * n_features + feature;
            let updated = P::mean(global.sums[index], count);
            let diff = P::feature_to_f64(updated) - P::feature_to_f64(centroids[index]);
            shift_squared += diff * diff;
            centroids[index] = updated;
        }
    }
    shift_squared.sqrt()
}

/// Wall-clock spent in each coordinator phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub load_ms: f64,
    pub broadcast_ms: f64,
    pub compute_ms: f64,
    pub aggregate_ms: f64,
    pub total_ms: f64,
}

/// Outcome of a full coordinator run.
#[derive(Debug, Clone)]
pub struct RunOutcome<P: NumericPolicy> {
    /// Final centroid matrix (`n_clusters` × `n_features`).
    pub centroids: Array2<P::Feature>,
    /// Iterations actually performed.
    pub iterations: usize,
    /// Centroid shift of the last iteration.
    pub shift: f64,
    /// Whether the run stopped on the threshold rather than the cap.
    pub converged: bool,
    /// Cluster populations observed in the last iteration.
    pub cluster_sizes: Vec<u64>,
    /// Per-phase wall-clock breakdown.
    pub timings: PhaseTimings,
}

/// Host-side coordinator owning the global centroid matrix.
///
/// Runs the `Broadcast → Dispatch → Collect → Aggregate → ConvergeCheck`
/// loop. Dispatch blocks until every unit finishes; a failure in any unit
/// aborts the whole run.
pub struct Coordinator<P: NumericPolicy> {
    config: MeshConfig,
    units: Vec<ComputeUnit<P>>,
    centroids: Vec<P::Feature>,
    load_ms: f64,
}

impl<P: NumericPolicy> Coordinator<P> {
    /// Partition the dataset, load every unit's shard, and seed the
    /// centroid matrix from a deterministic function of cluster index.
    pub fn new<F>(config: &MeshConfig, points: ArrayView2<'_, P::Feature>, seed: F) -> Result<Self>
    where
        F: Fn(usize) -> Vec<P::Feature>,
    {
        config.validate()?;
        validate_policy::<P>(config)?;
        if points.nrows() != config.n_points || points.ncols() != config.n_features {
            return Err(MeshError::InvalidConfig(format!(
                "dataset is {}x{}, but the configuration declares {}x{}",
                points.nrows(),
                points.ncols(),
                config.n_points,
                config.n_features
            )));
        }

        let load_started = Instant::now();
        let partitions = partition(config.n_points, config.n_units)?;
        let units = partitions
            .iter()
            .map(|part| {
                let shard = points.slice(s![part.offset..part.offset + part.count, ..]);
                ComputeUnit::load(part.id, shard, config)
            })
            .collect::<Result<Vec<_>>>()?;
        let load_ms = load_started.elapsed().as_secs_f64() * 1e3;

        let centroids = seed_centroid_matrix::<P, _>(config.n_clusters, config.n_features, &seed)?;
        tracing::debug!(
            units = units.len(),
            load_ms,
            "units loaded and centroids seeded"
        );
        Ok(Self {
            config: config.clone(),
            units,
            centroids,
            load_ms,
        })
    }

    /// Iterate to convergence or the configured cap.
    pub fn run(&mut self) -> Result<RunOutcome<P>> {
        let n_clusters = self.config.n_clusters;
        let n_features = self.config.n_features;
        let mut timings = PhaseTimings {
            load_ms: self.load_ms,
            ..PhaseTimings::default()
        };
        let mut cluster_sizes = vec![0u64; n_clusters];
        let mut iteration = 0;
        let mut shift = f64::INFINITY;

        let run_started = Instant::now();
        while iteration < self.config.max_iterations {
            iteration += 1;

            let broadcast_started = Instant::now();
            for unit in &mut self.units {
                unit.write_centroids(&self.centroids)?;
            }
            timings.broadcast_ms += broadcast_started.elapsed().as_secs_f64() * 1e3;

            // Dispatch blocks here until every unit has produced its partial
            // result; iteration n+1 never overlaps collection of iteration n.
            let compute_started = Instant::now();
            let partials: Vec<ClusterAccumulator<P>> = self
                .units
                .par_iter()
                .map(|unit| unit.execute())
                .collect::<Result<_>>()?;
            timings.compute_ms += compute_started.elapsed().as_secs_f64() * 1e3;

            let aggregate_started = Instant::now();
            let global = aggregate(&partials, n_clusters, n_features);
            cluster_sizes.copy_from_slice(global.counts());
            shift = update_centroids::<P>(&mut self.centroids, &global);
            timings.aggregate_ms += aggregate_started.elapsed().as_secs_f64() * 1e3;

            tracing::debug!(iteration, shift, "iteration complete");
            if shift <= self.config.convergence_threshold {
                break;
            }
        }
        timings.total_ms = run_started.elapsed().as_secs_f64() * 1e3;

        let converged = shift <= self.config.convergence_threshold;
        tracing::info!(
            iterations = iteration,
            shift,
            converged,
            "coordinator loop finished"
        );
        let centroids = Array2::from_shape_vec((n_clusters, n_features), self.centroids.clone())
            .map_err(|err| MeshError::InvalidData(err.to_string()))?;
        Ok(RunOutcome {
            centroids,
            iterations: iteration,
            shift,
            converged,
            cluster_sizes,
            timings,
        })
    }
}

/// Build the flat seed matrix, checking every row's width.
fn seed_centroid_matrix<P, F>(
    n_clusters: usize,
    n_features: usize,
    seed: &F,
) -> Result<Vec<P::Feature>>
where
    P: NumericPolicy,
    F: Fn(usize) -> Vec<P::Feature>,
{
    let mut matrix = Vec::with_capacity(n_clusters * n_features);
    for cluster in 0..n_clusters {
        let row = seed(cluster);
        if row.len() != n_features {
            return Err(MeshError::InvalidConfig(format!(
                "seed for cluster {cluster} has {} features, expected {n_features}",
                row.len()
            )));
        }
        matrix.extend_from_slice(&row);
    }
    Ok(matrix)
}

/// Outcome of the single-threaded host reference clustering.
#[derive(Debug, Clone)]
pub struct ReferenceOutcome<P: NumericPolicy> {
    pub centroids: Array2<P::Feature>,
    pub iterations: usize,
    pub shift: f64,
    pub cluster_sizes: Vec<u64>,
}

/// Full-dataset reference clustering on the host, used as a correctness
/// oracle.
///
/// Shares the assignment and update helpers with the mesh path, so under
/// the quantized policy it reproduces the mesh trajectory bit for bit.
pub fn reference_kmeans<P, F>(
    config: &MeshConfig,
    points: ArrayView2<'_, P::Feature>,
    seed: F,
) -> Result<ReferenceOutcome<P>>
where
    P: NumericPolicy,
    F: Fn(usize) -> Vec<P::Feature>,
{
    config.validate()?;
    validate_policy::<P>(config)?;
    if points.nrows() != config.n_points || points.ncols() != config.n_features {
        return Err(MeshError::InvalidConfig(format!(
            "dataset is {}x{}, but the configuration declares {}x{}",
            points.nrows(),
            points.ncols(),
            config.n_points,
            config.n_features
        )));
    }
    let n_clusters = config.n_clusters;
    let n_features = config.n_features;
    let flat: Vec<P::Feature> = points.iter().copied().collect();
    let mut centroids = seed_centroid_matrix::<P, _>(n_clusters, n_features, &seed)?;

    let mut cluster_sizes = vec![0u64; n_clusters];
    let mut iteration = 0;
    let mut shift = f64::INFINITY;
    while iteration < config.max_iterations {
        iteration += 1;
        let mut accumulator = ClusterAccumulator::<P>::zeroed(n_clusters, n_features);
        for point in flat.chunks_exact(n_features) {
            let cluster = nearest_centroid::<P>(point, &centroids, n_features)?;
            accumulator.record(cluster, point);
        }
        cluster_sizes.copy_from_slice(accumulator.counts());
        shift = update_centroids::<P>(&mut centroids, &accumulator);
        if shift <= config.convergence_threshold {
            break;
        }
    }

    let centroids = Array2::from_shape_vec((n_clusters, n_features), centroids)
        .map_err(|err| MeshError::InvalidData(err.to_string()))?;
    Ok(ReferenceOutcome {
        centroids,
        iterations: iteration,
        shift,
        cluster_sizes,
    })
}

/// Mode-erased run summary for callers that work in `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRun {
    pub centroids: Vec<Vec<f64>>,
    pub iterations: usize,
    pub shift: f64,
    pub converged: bool,
    pub cluster_sizes: Vec<u64>,
    pub timings: PhaseTimings,
}

impl MeshRun {
    fn from_outcome<P: NumericPolicy>(outcome: &RunOutcome<P>) -> Self {
        Self {
            centroids: centroid_rows::<P>(&outcome.centroids),
            iterations: outcome.iterations,
            shift: outcome.shift,
            converged: outcome.converged,
            cluster_sizes: outcome.cluster_sizes.clone(),
            timings: outcome.timings,
        }
    }

    /// Persist the summary as JSON.
    pub fn save<Q: AsRef<Path>>(&self, path: Q) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn centroid_rows<P: NumericPolicy>(centroids: &Array2<P::Feature>) -> Vec<Vec<f64>> {
    centroids
        .outer_iter()
        .map(|row| row.iter().map(|&value| P::feature_to_f64(value)).collect())
        .collect()
}

/// Run mesh clustering in the configured numeric mode.
///
/// `seed` is a deterministic function of cluster index producing each seed
/// centroid in `f64`; under the quantized mode the dataset and the seeds are
/// rounded to `i16` first.
pub fn run_clustering<F>(config: &MeshConfig, points: &DataMatrix, seed: F) -> Result<MeshRun>
where
    F: Fn(usize) -> Vec<f64>,
{
    match config.numeric_mode {
        NumericMode::Real => {
            let mut coordinator = Coordinator::<RealPolicy>::new(config, points.view(), &seed)?;
            let outcome = coordinator.run()?;
            Ok(MeshRun::from_outcome(&outcome))
        }
        NumericMode::Quantized => {
            let quantized = quantize_points(points)?;
            let seeds = quantize_points(&seed_rows_f64(config, &seed)?)?;
            let seeder = |cluster: usize| seeds.row(cluster).to_vec();
            let mut coordinator =
                Coordinator::<QuantizedPolicy>::new(config, quantized.view(), &seeder)?;
            let outcome = coordinator.run()?;
            Ok(MeshRun::from_outcome(&outcome))
        }
    }
}

/// Run the host reference oracle in the configured numeric mode.
pub fn run_reference<F>(config: &MeshConfig, points: &DataMatrix, seed: F) -> Result<MeshRun>
where
    F: Fn(usize) -> Vec<f64>,
{
    match config.numeric_mode {
        NumericMode::Real => {
            let outcome = reference_kmeans::<RealPolicy, _>(config, points.view(), &seed)?;
            Ok(MeshRun {
                centroids: centroid_rows::<RealPolicy>(&outcome.centroids),
                iterations: outcome.iterations,
                shift: outcome.shift,
                converged: outcome.shift <= config.convergence_threshold,
                cluster_sizes: outcome.cluster_sizes,
                timings: PhaseTimings::default(),
            })
        }
        NumericMode::Quantized => {
            let quantized = quantize_points(points)?;
            let seeds = quantize_points(&seed_rows_f64(config, &seed)?)?;
            let seeder = |cluster: usize| seeds.row(cluster).to_vec();
            let outcome =
                reference_kmeans::<QuantizedPolicy, _>(config, quantized.view(), &seeder)?;
            Ok(MeshRun {
                centroids: centroid_rows::<QuantizedPolicy>(&outcome.centroids),
                iterations: outcome.iterations,
                shift: outcome.shift,
                converged: outcome.shift <= config.convergence_threshold,
                cluster_sizes: outcome.cluster_sizes,
                timings: PhaseTimings::default(),
            })
        }
    }
}

fn seed_rows_f64<F>(config: &MeshConfig, seed: &F) -> Result<DataMatrix>
where
    F: Fn(usize) -> Vec<f64>,
{
    let mut rows = Array2::zeros((config.n_clusters, config.n_features));
    for cluster in 0..config.n_clusters {
        let row = seed(cluster);
        if row.len() != config.n_features {
            return Err(MeshError::InvalidConfig(format!(
                "seed for cluster {cluster} has {} features, expected {}",
                row.len(),
                config.n_features
            )));
        }
        for (feature, value) in row.into_iter().enumerate() {
            rows[(cluster, feature)] = value;
        }
    }
    Ok(rows)
}

/// Generate uniform points in `[0, FEATURE_RANGE)` using a reproducible RNG.
pub fn generate_points(n: usize, dim: usize, rng: &mut ChaCha8Rng) -> DataMatrix {
    Array2::random_using((n, dim), Uniform::new(0.0, FEATURE_RANGE), rng)
}

/// Round a floating dataset to `i16` features, rejecting out-of-range values.
pub fn quantize_points(points: &DataMatrix) -> Result<Array2<i16>> {
    let mut values = Vec::with_capacity(points.len());
    for &value in points.iter() {
        values.push(quantize_value(value)?);
    }
    Array2::from_shape_vec((points.nrows(), points.ncols()), values)
        .map_err(|err| MeshError::InvalidData(err.to_string()))
}

fn quantize_value(value: f64) -> Result<i16> {
    if !value.is_finite() {
        return Err(MeshError::InvalidData(format!(
            "cannot quantize non-finite value {value}"
        )));
    }
    let rounded = value.round();
    if rounded < f64::from(i16::MIN) || rounded > f64::from(i16::MAX) {
        return Err(MeshError::InvalidData(format!(
            "value {value} does not fit a 16-bit feature"
        )));
    }
    Ok(rounded as i16)
}

/// DataLoader abstraction to load CSV/Parquet into a [`DataMatrix`].
pub struct DataLoader;

impl DataLoader {
    /// Load a CSV file into memory assuming numeric columns.
    pub fn load_csv<Q: AsRef<Path>>(path: Q) -> Result<DataMatrix> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut records: Vec<Vec<f64>> = Vec::new();
        let mut width = None;
        for record in rdr.records() {
            let record = record?;
            let mut row = Vec::with_capacity(record.len());
            for field in record.iter() {
                row.push(field.parse()?);
            }
            if let Some(expected) = width {
                if expected != row.len() {
                    return Err(MeshError::InvalidData(format!(
                        "found inconsistent row width: expected {expected}, got {}",
                        row.len()
                    )));
                }
            } else {
                width = Some(row.len());
            }
            records.push(row);
        }
        let Some(dim) = width else {
            return Ok(Array2::zeros((0, 0)));
        };

        let n = records.len();
        let mut arr = Array2::zeros((n, dim));
        for (i, row) in records.into_iter().enumerate() {
            for (j, value) in row.into_iter().enumerate() {
                arr[(i, j)] = value;
            }
        }
        Ok(arr)
    }

    /// Load a Parquet file containing only numeric (int/float) columns.
    pub fn load_parquet<Q: AsRef<Path>>(path: Q) -> Result<DataMatrix> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let rows: Vec<Row> = reader
            .get_row_iter(None)?
            .collect::<std::result::Result<_, _>>()?;
        if rows.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }
        let width = rows[0].len();
        let mut data = Array2::zeros((rows.len(), width));

        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(MeshError::InvalidData(format!(
                    "row {i} width mismatch: expected {width}, found {}",
                    row.len()
                )));
            }
            for (j, (_, field)) in row.get_column_iter().enumerate() {
                let value = match field {
                    Field::Double(v) => *v,
                    Field::Float(v) => *v as f64,
                    Field::Int(v) => *v as f64,
                    Field::Long(v) => *v as f64,
                    Field::Short(v) => *v as f64,
                    Field::Byte(v) => *v as f64,
                    Field::UInt(v) => *v as f64,
                    Field::ULong(v) => *v as f64,
                    Field::UShort(v) => *v as f64,
                    Field::UByte(v) => *v as f64,
                    Field::Null => {
                        return Err(MeshError::InvalidData(format!(
                            "column {j} contained a NULL value which cannot be converted to f64"
                        )))
                    }
                    other => {
                        return Err(MeshError::InvalidData(format!(
                            "unsupported parquet field at column {j}: {other:?}"
                        )))
                    }
                };
                data[(i, j)] = value;
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy_points() -> DataMatrix {
        Array2::from_shape_vec(
            (8, 2),
            vec![
                0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 10.0, 10.0, 10.0, 11.0, 11.0, 10.0, 11.0,
                11.0,
            ],
        )
        .expect("toy shape")
    }

    fn toy_seed(cluster: usize) -> Vec<f64> {
        match cluster {
            0 => vec![0.0, 0.0],
            _ => vec![10.0, 0.0],
        }
    }

    fn toy_config() -> MeshConfig {
        MeshConfig {
            n_points: 8,
            n_features: 2,
            n_clusters: 2,
            n_units: 2,
            n_lanes_per_unit: 1,
            convergence_threshold: 1e-6,
            max_iterations: 20,
            numeric_mode: NumericMode::Real,
            scratch_capacity_bytes: 4096,
        }
    }

    #[test]
    fn partition_balances_remainder() {
        let parts = partition(10, 3).expect("partition succeeds");
        assert_eq!(
            parts,
            vec![
                Partition {
                    id: 0,
                    offset: 0,
                    count: 4
                },
                Partition {
                    id: 1,
                    offset: 4,
                    count: 3
                },
                Partition {
                    id: 2,
                    offset: 7,
                    count: 3
                },
            ]
        );
    }

    #[test]
    fn partition_covers_range_exactly() {
        for n in [0usize, 1, 7, 64, 1000] {
            for parts_count in [1usize, 2, 3, 7, 16] {
                let parts = partition(n, parts_count).expect("partition succeeds");
                assert_eq!(parts.len(), parts_count);
                let mut expected_offset = 0;
                for part in &parts {
                    assert_eq!(part.offset, expected_offset);
                    expected_offset += part.count;
                }
                assert_eq!(expected_offset, n);
                let max = parts.iter().map(|p| p.count).max().unwrap_or(0);
                let min = parts.iter().map(|p| p.count).min().unwrap_or(0);
                assert!(max - min <= 1, "sizes differ by more than one");
            }
        }
    }

    #[test]
    fn partition_rejects_zero_workers() {
        let err = partition(10, 0).unwrap_err();
        assert!(matches!(err, MeshError::InvalidConfig(_)));
    }

    #[test]
    fn lane_counts_cover_unit_shard() {
        let config = MeshConfig {
            n_points: 10,
            n_lanes_per_unit: 3,
            ..toy_config()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let points = generate_points(10, 2, &mut rng);
        let mut unit =
            ComputeUnit::<RealPolicy>::load(0, points.view(), &config).expect("unit loads");
        unit.write_centroids(&[0.0, 0.0, 50.0, 50.0])
            .expect("broadcast");
        let partial = unit.execute().expect("kernel runs");
        assert_eq!(partial.total_count(), 10);
    }

    #[test]
    fn global_counts_cover_dataset() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let points = generate_points(257, 3, &mut rng);
        let config = MeshConfig {
            n_points: 257,
            n_features: 3,
            n_clusters: 4,
            n_units: 5,
            n_lanes_per_unit: 3,
            convergence_threshold: 1e-4,
            max_iterations: 10,
            numeric_mode: NumericMode::Real,
            scratch_capacity_bytes: 256,
        };
        let seed = |cluster: usize| points.row(cluster * 10).to_vec();
        let run = run_clustering(&config, &points, seed).expect("run succeeds");
        assert_eq!(run.cluster_sizes.iter().sum::<u64>(), 257);
    }

    #[test]
    fn toy_dataset_first_iteration() {
        let points = toy_points();
        let config = MeshConfig {
            max_iterations: 1,
            convergence_threshold: 0.0,
            ..toy_config()
        };
        let run = run_clustering(&config, &points, toy_seed).expect("run succeeds");
        assert_eq!(run.iterations, 1);
        assert_eq!(run.centroids, vec![vec![0.5, 0.5], vec![10.5, 10.5]]);
        assert_eq!(run.cluster_sizes, vec![4, 4]);
        // Norm of [(0.5,0.5)-(0,0), (10.5,10.5)-(10,0)].
        assert_eq!(run.shift, 111.0_f64.sqrt());
        assert!(!run.converged);
    }

    #[test]
    fn toy_dataset_converges_in_two_iterations() {
        let run = run_clustering(&toy_config(), &toy_points(), toy_seed).expect("run succeeds");
        assert_eq!(run.iterations, 2);
        assert!(run.converged);
        assert_eq!(run.shift, 0.0);
        assert_eq!(run.centroids, vec![vec![0.5, 0.5], vec![10.5, 10.5]]);
    }

    #[test]
    fn aggregation_is_stateless() {
        let mut first = ClusterAccumulator::<RealPolicy>::zeroed(2, 2);
        first.record(0, &[1.0, 2.0]);
        first.record(1, &[3.0, 4.0]);
        let mut second = ClusterAccumulator::<RealPolicy>::zeroed(2, 2);
        second.record(0, &[5.0, 6.0]);
        let partials = vec![first, second];

        let mut centroids_a = vec![0.0, 0.0, 0.0, 0.0];
        let mut centroids_b = centroids_a.clone();
        let shift_a = update_centroids::<RealPolicy>(&mut centroids_a, &aggregate(&partials, 2, 2));
        let shift_b = update_centroids::<RealPolicy>(&mut centroids_b, &aggregate(&partials, 2, 2));
        assert_eq!(centroids_a, centroids_b);
        assert_eq!(shift_a, shift_b);
        assert_eq!(centroids_a, vec![3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn empty_cluster_keeps_centroid() {
        let points = toy_points();
        let config = MeshConfig {
            n_clusters: 3,
            ..toy_config()
        };
        let seed = |cluster: usize| match cluster {
            0 => vec![0.0, 0.0],
            1 => vec![10.0, 0.0],
            _ => vec![1000.0, 1000.0],
        };
        let run = run_clustering(&config, &points, seed).expect("run succeeds");
        assert_eq!(run.cluster_sizes[2], 0);
        assert_eq!(run.centroids[2], vec![1000.0, 1000.0]);
    }

    #[test]
    fn quantized_mesh_matches_reference_exactly() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let points = generate_points(257, 3, &mut rng);
        let config = MeshConfig {
            n_points: 257,
            n_features: 3,
            n_clusters: 4,
            n_units: 3,
            n_lanes_per_unit: 2,
            convergence_threshold: 1e-4,
            max_iterations: 50,
            numeric_mode: NumericMode::Quantized,
            scratch_capacity_bytes: 64,
        };
        let seed = |cluster: usize| points.row(cluster * 17).to_vec();
        let mesh = run_clustering(&config, &points, seed).expect("mesh run");
        let reference = run_reference(&config, &points, seed).expect("reference run");
        assert_eq!(mesh.centroids, reference.centroids);
        assert_eq!(mesh.iterations, reference.iterations);
        assert_eq!(mesh.shift, reference.shift);
    }

    #[test]
    fn single_unit_real_run_matches_reference() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let points = generate_points(100, 2, &mut rng);
        let config = MeshConfig {
            n_points: 100,
            n_features: 2,
            n_clusters: 3,
            n_units: 1,
            n_lanes_per_unit: 1,
            convergence_threshold: 1e-9,
            max_iterations: 100,
            numeric_mode: NumericMode::Real,
            scratch_capacity_bytes: 512,
        };
        let seed = |cluster: usize| points.row(cluster * 30).to_vec();
        let mesh = run_clustering(&config, &points, seed).expect("mesh run");
        let reference = run_reference(&config, &points, seed).expect("reference run");
        // One unit, one lane: identical accumulation order, so bit-equal.
        assert_eq!(mesh.centroids, reference.centroids);
        assert_eq!(mesh.iterations, reference.iterations);
        assert_eq!(mesh.shift, reference.shift);
    }

    #[test]
    fn multi_unit_real_run_tracks_reference() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let points = generate_points(300, 3, &mut rng);
        let config = MeshConfig {
            n_points: 300,
            n_features: 3,
            n_clusters: 4,
            n_units: 4,
            n_lanes_per_unit: 2,
            convergence_threshold: 1e-12,
            max_iterations: 40,
            numeric_mode: NumericMode::Real,
            scratch_capacity_bytes: 1024,
        };
        let seed = |cluster: usize| points.row(cluster * 70).to_vec();
        let mesh = run_clustering(&config, &points, seed).expect("mesh run");
        let reference = run_reference(&config, &points, seed).expect("reference run");
        for (mesh_row, reference_row) in mesh.centroids.iter().zip(reference.centroids.iter()) {
            for (a, b) in mesh_row.iter().zip(reference_row.iter()) {
                assert!((a - b).abs() < 1e-6, "centroids diverged: {a} vs {b}");
            }
        }
    }

    #[test]
    fn batch_size_does_not_change_results() {
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let points = generate_points(120, 4, &mut rng);
        let base = MeshConfig {
            n_points: 120,
            n_features: 4,
            n_clusters: 3,
            n_units: 2,
            n_lanes_per_unit: 2,
            convergence_threshold: 1e-6,
            max_iterations: 30,
            numeric_mode: NumericMode::Real,
            // One point per batch.
            scratch_capacity_bytes: 32,
        };
        let roomy = MeshConfig {
            scratch_capacity_bytes: 1 << 20,
            ..base.clone()
        };
        let seed = |cluster: usize| points.row(cluster * 40).to_vec();
        let tight_run = run_clustering(&base, &points, seed).expect("tight run");
        let roomy_run = run_clustering(&roomy, &points, seed).expect("roomy run");
        assert_eq!(tight_run.centroids, roomy_run.centroids);
        assert_eq!(tight_run.iterations, roomy_run.iterations);
        assert_eq!(tight_run.shift, roomy_run.shift);
    }

    #[test]
    fn scratch_too_small_for_one_point() {
        let err = ScratchBuffer::<RealPolicy>::for_run(8, 2).unwrap_err();
        assert!(matches!(err, MeshError::CapacityViolation(_)));

        let config = MeshConfig {
            scratch_capacity_bytes: 8,
            ..toy_config()
        };
        let err = run_clustering(&config, &toy_points(), toy_seed).unwrap_err();
        assert!(matches!(err, MeshError::CapacityViolation(_)));
    }

    #[test]
    fn degenerate_centroids_rejected() {
        let err = nearest_centroid::<RealPolicy>(&[1.0, 2.0], &[], 2).unwrap_err();
        assert!(matches!(err, MeshError::DegenerateAssignment(_)));

        let config = MeshConfig {
            n_clusters: 0,
            ..toy_config()
        };
        let err = run_clustering(&config, &toy_points(), toy_seed).unwrap_err();
        assert!(matches!(err, MeshError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_broadcast_rejected() {
        let config = MeshConfig {
            n_units: 1,
            ..toy_config()
        };
        let points = toy_points();
        let mut unit =
            ComputeUnit::<RealPolicy>::load(0, points.view(), &config).expect("unit loads");
        let err = unit.write_centroids(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, MeshError::DegenerateAssignment(_)));
    }

    #[test]
    fn mode_mismatch_rejected() {
        let config = MeshConfig {
            numeric_mode: NumericMode::Quantized,
            ..toy_config()
        };
        let points = toy_points();
        let err = Coordinator::<RealPolicy>::new(&config, points.view(), |_| vec![0.0, 0.0])
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidConfig(_)));
    }

    #[test]
    fn quantize_rejects_out_of_range() {
        let points = Array2::from_shape_vec((1, 2), vec![1.0, 40_000.0]).expect("shape");
        let err = quantize_points(&points).unwrap_err();
        assert!(matches!(err, MeshError::InvalidData(_)));
    }

    #[test]
    fn quantized_width_check_rejects_huge_runs() {
        let config = MeshConfig {
            n_points: usize::MAX,
            numeric_mode: NumericMode::Quantized,
            ..toy_config()
        };
        let err = validate_policy::<QuantizedPolicy>(&config).unwrap_err();
        assert!(matches!(err, MeshError::InvalidConfig(_)));
    }

    #[test]
    fn ties_resolve_to_lowest_index() {
        // Point equidistant from both centroids.
        let cluster = nearest_centroid::<RealPolicy>(&[5.0, 0.0], &[0.0, 0.0, 10.0, 0.0], 2)
            .expect("assignment succeeds");
        assert_eq!(cluster, 0);

        let cluster = nearest_centroid::<QuantizedPolicy>(&[5, 0], &[0, 0, 10, 0], 2)
            .expect("assignment succeeds");
        assert_eq!(cluster, 0);
    }

    #[test]
    fn read_batch_respects_capacity_and_bounds() {
        let points = toy_points();
        let store = PointStore::<RealPolicy>::load(points.view());
        let mut scratch = ScratchBuffer::<RealPolicy>::for_run(3 * 16, 2).expect("scratch");
        assert_eq!(scratch.capacity_points(), 3);

        let staged = store.read_batch(0, 8, &mut scratch).expect("read succeeds");
        assert_eq!(staged, 3);
        assert_eq!(scratch.points().count(), 3);

        let err = store.read_batch(7, 2, &mut scratch).unwrap_err();
        assert!(matches!(err, MeshError::Transfer(_)));
    }
}
