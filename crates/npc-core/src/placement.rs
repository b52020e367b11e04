//! Placement allocator: unoccupied map coordinates for new NPCs.
//!
//! Allocation reads one snapshot of the occupied tiles around the map center
//! and samples against it with [`plan_positions`], a pure function of the
//! snapshot, the parameters, and the RNG. The allocator does not reserve
//! anything: the per-world commit claims each tile atomically, and the
//! loser of a race gets a tile conflict.
//!
//! # Strategies
//!
//! - `random_scatter`: uniform over the square of half-width `max_radius`,
//!   minus the exclusion disk around the center.
//! - `quadrant_balanced`: the count is split across NE, NW, SW, SE (the
//!   remainder goes to the earlier quadrants), then sampled per quadrant.
//! - `kingdom_clustering`: `ceil(count / cluster_size)` cluster centers at
//!   evenly spaced angles on a ring midway between the exclusion radius and
//!   `max_radius`; points are sampled within `cluster_radius` of their
//!   center, falling back to random scatter when a cluster is saturated.

use std::collections::BTreeSet;
use std::f64::consts::TAU;
use std::time::Duration;

use npc_types::{Coordinates, PlacementStrategy, WorldId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::PlacementConfig;
use crate::error::{PlacementError, bounded};
use crate::registry::WorldRegistry;

/// Parameters of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementParams {
    /// Map center.
    pub center: Coordinates,
    /// Half-width of the sampling square around the center.
    pub max_radius: u32,
    /// Radius of the disk around the center that stays empty.
    pub center_exclusion_radius: u32,
    /// Samples tried per point before giving up.
    pub max_attempts_per_point: u32,
    /// NPCs per kingdom cluster.
    pub cluster_size: u32,
    /// Radius of a kingdom cluster.
    pub cluster_radius: u32,
    /// Seed for reproducible plans. `None` draws a fresh seed.
    pub seed: Option<u64>,
}

impl From<&PlacementConfig> for PlacementParams {
    fn from(config: &PlacementConfig) -> Self {
        Self {
            center: Coordinates::new(config.center_x, config.center_y),
            max_radius: config.max_radius,
            center_exclusion_radius: config.center_exclusion_radius,
            max_attempts_per_point: config.max_attempts_per_point,
            cluster_size: config.cluster_size,
            cluster_radius: config.cluster_radius,
            seed: None,
        }
    }
}

impl Default for PlacementParams {
    fn default() -> Self {
        Self::from(&PlacementConfig::default())
    }
}

impl PlacementParams {
    /// Reject parameters that leave nothing to sample from.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::InvalidParams`] describing the problem.
    pub fn validate(&self) -> Result<(), PlacementError> {
        if self.max_radius == 0 {
            return Err(PlacementError::InvalidParams(String::from(
                "max_radius must be positive",
            )));
        }
        if self.center_exclusion_radius >= self.max_radius {
            return Err(PlacementError::InvalidParams(format!(
                "center_exclusion_radius {} must be below max_radius {}",
                self.center_exclusion_radius, self.max_radius
            )));
        }
        if self.max_attempts_per_point == 0 {
            return Err(PlacementError::InvalidParams(String::from(
                "max_attempts_per_point must be positive",
            )));
        }
        if self.cluster_size == 0 {
            return Err(PlacementError::InvalidParams(String::from(
                "cluster_size must be positive",
            )));
        }
        Ok(())
    }

    /// Tiles in the sampling square, an upper bound on distinct placements.
    pub fn sampling_area(&self) -> u64 {
        let side = u64::from(self.max_radius).saturating_mul(2).saturating_add(1);
        side.saturating_mul(side)
    }

    /// Whether a tile lies in the sampling square and outside the exclusion
    /// disk.
    pub fn contains(&self, tile: Coordinates) -> bool {
        let exclusion = i64::from(self.center_exclusion_radius);
        tile.x.abs_diff(self.center.x) <= self.max_radius
            && tile.y.abs_diff(self.center.y) <= self.max_radius
            && tile.distance_squared(self.center) >= exclusion.saturating_mul(exclusion)
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }
}

/// Map quadrants relative to the center, in allocation order.
///
/// Each quadrant owns one half-axis so the four partition the plane minus
/// the center tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quadrant {
    /// `dx >= 0, dy > 0`.
    NorthEast,
    /// `dx < 0, dy >= 0`.
    NorthWest,
    /// `dx <= 0, dy < 0`.
    SouthWest,
    /// `dx > 0, dy <= 0`.
    SouthEast,
}

impl Quadrant {
    /// Allocation order.
    pub const ALL: [Self; 4] = [
        Self::NorthEast,
        Self::NorthWest,
        Self::SouthWest,
        Self::SouthEast,
    ];

    /// Quadrant of a tile relative to `center`. `None` for the center.
    pub fn of(tile: Coordinates, center: Coordinates) -> Option<Self> {
        let dx = i64::from(tile.x).saturating_sub(i64::from(center.x));
        let dy = i64::from(tile.y).saturating_sub(i64::from(center.y));
        if dx >= 0 && dy > 0 {
            Some(Self::NorthEast)
        } else if dx < 0 && dy >= 0 {
            Some(Self::NorthWest)
        } else if dx <= 0 && dy < 0 {
            Some(Self::SouthWest)
        } else if dx > 0 && dy <= 0 {
            Some(Self::SouthEast)
        } else {
            None
        }
    }

    /// Offset ranges `(dx, dy)` of the quadrant within `radius`.
    const fn ranges(self, radius: i64) -> ((i64, i64), (i64, i64)) {
        let neg = radius.saturating_neg();
        match self {
            Self::NorthEast => ((0, radius), (1, radius)),
            Self::NorthWest => ((neg, -1), (0, radius)),
            Self::SouthWest => ((neg, 0), (neg, -1)),
            Self::SouthEast => ((1, radius), (neg, 0)),
        }
    }
}

/// Split `count` across the four quadrants, remainder first.
pub fn quadrant_split(count: u32) -> [u32; 4] {
    let base = count / 4;
    let remainder = count % 4;
    [
        base.saturating_add(u32::from(remainder > 0)),
        base.saturating_add(u32::from(remainder > 1)),
        base.saturating_add(u32::from(remainder > 2)),
        base,
    ]
}

#[derive(Debug, Clone, Copy)]
enum Region {
    Square,
    Quadrant(Quadrant),
    Disk { center: Coordinates, radius: u32 },
}

struct Sampler<'a, R: ?Sized> {
    params: &'a PlacementParams,
    occupied: &'a BTreeSet<Coordinates>,
    chosen: BTreeSet<Coordinates>,
    placed: Vec<Coordinates>,
    requested: u32,
    rng: &'a mut R,
}

impl<R: Rng + ?Sized> Sampler<'_, R> {
    fn candidate(&mut self, region: Region) -> Option<Coordinates> {
        let radius = i64::from(self.params.max_radius);
        let (origin, (dx, dy)) = match region {
            Region::Square => (
                self.params.center,
                (
                    self.rng.random_range(radius.saturating_neg()..=radius),
                    self.rng.random_range(radius.saturating_neg()..=radius),
                ),
            ),
            Region::Quadrant(quadrant) => {
                let ((x_lo, x_hi), (y_lo, y_hi)) = quadrant.ranges(radius);
                (
                    self.params.center,
                    (
                        self.rng.random_range(x_lo..=x_hi),
                        self.rng.random_range(y_lo..=y_hi),
                    ),
                )
            }
            Region::Disk { center, radius } => {
                let r = i64::from(radius);
                let dx = self.rng.random_range(r.saturating_neg()..=r);
                let dy = self.rng.random_range(r.saturating_neg()..=r);
                let inside = dx
                    .saturating_mul(dx)
                    .saturating_add(dy.saturating_mul(dy))
                    <= r.saturating_mul(r);
                if !inside {
                    return None;
                }
                (center, (dx, dy))
            }
        };
        let x = i32::try_from(i64::from(origin.x).saturating_add(dx)).ok()?;
        let y = i32::try_from(i64::from(origin.y).saturating_add(dy)).ok()?;
        Some(Coordinates::new(x, y))
    }

    fn try_region(&mut self, region: Region) -> bool {
        for _ in 0..self.params.max_attempts_per_point {
            let Some(tile) = self.candidate(region) else {
                continue;
            };
            if self.params.contains(tile)
                && !self.occupied.contains(&tile)
                && self.chosen.insert(tile)
            {
                self.placed.push(tile);
                return true;
            }
        }
        false
    }

    fn place(&mut self, region: Region) -> Result<(), PlacementError> {
        if self.try_region(region) {
            return Ok(());
        }
        Err(self.exhausted())
    }

    fn exhausted(&self) -> PlacementError {
        PlacementError::Exhausted {
            placed: u32::try_from(self.placed.len()).unwrap_or(u32::MAX),
            requested: self.requested,
            attempts: self.params.max_attempts_per_point,
        }
    }
}

/// Cluster centers for `clusters` kingdoms, evenly spaced on the ring
/// midway between the exclusion radius and `max_radius`.
#[allow(clippy::cast_possible_truncation)]
pub fn cluster_centers<R: Rng + ?Sized>(
    params: &PlacementParams,
    clusters: u32,
    rng: &mut R,
) -> Vec<Coordinates> {
    if clusters == 0 {
        return Vec::new();
    }
    let ring = (f64::from(params.center_exclusion_radius) + f64::from(params.max_radius)) / 2.0;
    let phase = rng.random_range(0.0..TAU);
    let step = TAU / f64::from(clusters);

    (0..clusters)
        .filter_map(|i| {
            let angle = f64::from(i).mul_add(step, phase);
            let dx = (ring * angle.cos()).round() as i64;
            let dy = (ring * angle.sin()).round() as i64;
            let x = i32::try_from(i64::from(params.center.x).saturating_add(dx)).ok()?;
            let y = i32::try_from(i64::from(params.center.y).saturating_add(dy)).ok()?;
            Some(Coordinates::new(x, y))
        })
        .collect()
}

/// Points reserved up front; larger plans grow as they are placed.
const PREALLOCATED_POINTS: u32 = 4_096;

/// Sample `count` distinct free tiles for `strategy`.
///
/// `occupied` is the snapshot to avoid. The result never contains a tile in
/// `occupied`, a duplicate, or a tile outside [`PlacementParams::contains`].
///
/// # Errors
///
/// Returns [`PlacementError::InvalidParams`] for unusable parameters, or
/// [`PlacementError::Exhausted`] when one point cannot be placed within
/// `max_attempts_per_point` samples. A `count` above
/// [`PlacementParams::sampling_area`] is exhausted before any sampling.
pub fn plan_positions<R: Rng + ?Sized>(
    count: u32,
    strategy: PlacementStrategy,
    params: &PlacementParams,
    occupied: &BTreeSet<Coordinates>,
    rng: &mut R,
) -> Result<Vec<Coordinates>, PlacementError> {
    params.validate()?;
    if u64::from(count) > params.sampling_area() {
        return Err(PlacementError::Exhausted {
            placed: 0,
            requested: count,
            attempts: 0,
        });
    }

    let reserve = usize::try_from(count.min(PREALLOCATED_POINTS)).unwrap_or(0);
    let mut sampler = Sampler {
        params,
        occupied,
        chosen: BTreeSet::new(),
        placed: Vec::with_capacity(reserve),
        requested: count,
        rng,
    };

    match strategy {
        PlacementStrategy::RandomScatter => {
            for _ in 0..count {
                sampler.place(Region::Square)?;
            }
        }
        PlacementStrategy::QuadrantBalanced => {
            for (quadrant, share) in Quadrant::ALL.into_iter().zip(quadrant_split(count)) {
                for _ in 0..share {
                    sampler.place(Region::Quadrant(quadrant))?;
                }
            }
        }
        PlacementStrategy::KingdomClustering => {
            let clusters = count.div_ceil(params.cluster_size);
            let centers = cluster_centers(params, clusters, &mut *sampler.rng);
            let mut remaining = count;
            for center in centers {
                let share = remaining.min(params.cluster_size);
                remaining = remaining.saturating_sub(share);
                for _ in 0..share {
                    let region = Region::Disk {
                        center,
                        radius: params.cluster_radius,
                    };
                    if !sampler.try_region(region) {
                        sampler.place(Region::Square)?;
                    }
                }
            }
            // Centers that fell off the coordinate range leave points over.
            for _ in 0..remaining {
                sampler.place(Region::Square)?;
            }
        }
    }

    Ok(sampler.placed)
}

/// Allocates placements against a world's current map.
pub struct PlacementAllocator<'a> {
    registry: &'a WorldRegistry,
    call_timeout: Duration,
}

impl<'a> PlacementAllocator<'a> {
    /// Create an allocator resolving worlds through `registry`.
    pub const fn new(registry: &'a WorldRegistry, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
        }
    }

    /// `count` distinct tiles, each unoccupied when the snapshot was read.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::Registry`] if the world is unknown or
    /// inactive, [`PlacementError::Store`] if the snapshot read fails, and
    /// the errors of [`plan_positions`].
    pub async fn allocate(
        &self,
        world_id: WorldId,
        count: u32,
        strategy: PlacementStrategy,
        params: &PlacementParams,
    ) -> Result<Vec<Coordinates>, PlacementError> {
        params.validate()?;
        let store = self.registry.connect(world_id).await?;
        let occupied = bounded(
            self.call_timeout,
            "occupied tile scan",
            store.occupied_tiles(params.center, params.max_radius),
        )
        .await?;

        let mut rng = params.rng();
        let points = plan_positions(count, strategy, params, &occupied, &mut rng)?;
        debug!(
            world_id = %world_id,
            strategy = %strategy,
            count,
            occupied = occupied.len(),
            "allocated placements"
        );
        Ok(points)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn params(max_radius: u32, exclusion: u32) -> PlacementParams {
        PlacementParams {
            center: Coordinates::ORIGIN,
            max_radius,
            center_exclusion_radius: exclusion,
            max_attempts_per_point: 200,
            cluster_size: 15,
            cluster_radius: 6,
            seed: Some(7),
        }
    }

    fn seeded(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn quadrant_split_gives_remainder_to_first_quadrants() {
        assert_eq!(quadrant_split(0), [0, 0, 0, 0]);
        assert_eq!(quadrant_split(5), [2, 1, 1, 1]);
        assert_eq!(quadrant_split(7), [2, 2, 2, 1]);
        assert_eq!(quadrant_split(8), [2, 2, 2, 2]);
    }

    #[test]
    fn quadrant_of_partitions_the_plane() {
        let c = Coordinates::ORIGIN;
        assert_eq!(Quadrant::of(Coordinates::new(0, 1), c), Some(Quadrant::NorthEast));
        assert_eq!(Quadrant::of(Coordinates::new(-1, 0), c), Some(Quadrant::NorthWest));
        assert_eq!(Quadrant::of(Coordinates::new(0, -1), c), Some(Quadrant::SouthWest));
        assert_eq!(Quadrant::of(Coordinates::new(1, 0), c), Some(Quadrant::SouthEast));
        assert_eq!(Quadrant::of(c, c), None);
    }

    #[test]
    fn quadrant_balanced_fills_each_quadrant() {
        let p = params(30, 3);
        let points = plan_positions(
            10,
            PlacementStrategy::QuadrantBalanced,
            &p,
            &BTreeSet::new(),
            &mut seeded(1),
        )
        .unwrap();

        let counts: Vec<u32> = Quadrant::ALL
            .iter()
            .map(|q| {
                let n = points
                    .iter()
                    .filter(|point| Quadrant::of(**point, p.center) == Some(*q))
                    .count();
                u32::try_from(n).unwrap()
            })
            .collect();
        assert_eq!(counts, quadrant_split(10).to_vec());
    }

    #[test]
    fn kingdom_clustering_groups_points_near_centers() {
        let p = params(100, 10);
        let points = plan_positions(
            30,
            PlacementStrategy::KingdomClustering,
            &p,
            &BTreeSet::new(),
            &mut seeded(3),
        )
        .unwrap();
        assert_eq!(points.len(), 30);

        let centers = cluster_centers(&p, 2, &mut seeded(3));
        assert_eq!(centers.len(), 2);
        let limit = i64::from(p.cluster_radius).pow(2);
        for point in &points {
            assert!(centers.iter().any(|c| point.distance_squared(*c) <= limit));
        }
    }

    #[test]
    fn saturated_cluster_falls_back_to_scatter() {
        let mut p = params(40, 2);
        p.cluster_radius = 0;
        p.cluster_size = 5;
        let points = plan_positions(
            5,
            PlacementStrategy::KingdomClustering,
            &p,
            &BTreeSet::new(),
            &mut seeded(9),
        )
        .unwrap();
        assert_eq!(points.len(), 5);
        assert_eq!(points.iter().collect::<BTreeSet<_>>().len(), 5);
    }

    #[test]
    fn full_map_is_exhausted() {
        let p = params(1, 0);
        let occupied: BTreeSet<Coordinates> = (-1..=1)
            .flat_map(|x| (-1..=1).map(move |y| Coordinates::new(x, y)))
            .collect();
        let err = plan_positions(
            1,
            PlacementStrategy::RandomScatter,
            &p,
            &occupied,
            &mut seeded(0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PlacementError::Exhausted {
                placed: 0,
                requested: 1,
                ..
            }
        ));
    }

    #[test]
    fn more_points_than_free_tiles_is_exhausted() {
        // 5x5 square minus the center tile leaves 24 tiles.
        let mut p = params(2, 1);
        p.max_attempts_per_point = 5_000;
        let err = plan_positions(
            25,
            PlacementStrategy::RandomScatter,
            &p,
            &BTreeSet::new(),
            &mut seeded(0),
        )
        .unwrap_err();
        assert!(matches!(err, PlacementError::Exhausted { placed: 24, .. }));
    }

    #[test]
    fn count_beyond_the_square_fails_without_sampling() {
        let err = plan_positions(
            u32::MAX,
            PlacementStrategy::RandomScatter,
            &params(1, 0),
            &BTreeSet::new(),
            &mut seeded(0),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PlacementError::Exhausted {
                placed: 0,
                requested: u32::MAX,
                attempts: 0,
            }
        ));
        assert_eq!(params(1, 0).sampling_area(), 9);
    }

    #[test]
    fn same_seed_same_plan() {
        let p = params(50, 5);
        let empty = BTreeSet::new();
        let a = plan_positions(20, PlacementStrategy::RandomScatter, &p, &empty, &mut seeded(11))
            .unwrap();
        let b = plan_positions(20, PlacementStrategy::RandomScatter, &p, &empty, &mut seeded(11))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_exclusion_covering_the_map() {
        let err = params(5, 5).validate().unwrap_err();
        assert!(matches!(err, PlacementError::InvalidParams(_)));
    }

    fn strategy() -> impl Strategy<Value = PlacementStrategy> {
        prop::sample::select(PlacementStrategy::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn placements_are_distinct_free_and_in_bounds(
            seed in any::<u64>(),
            count in 0u32..40,
            max_radius in 12u32..60,
            exclusion in 0u32..8,
            strategy in strategy(),
            blocked in prop::collection::btree_set((-12i32..=12, -12i32..=12), 0..30),
        ) {
            let p = PlacementParams { seed: Some(seed), ..params(max_radius, exclusion) };
            let occupied: BTreeSet<Coordinates> =
                blocked.into_iter().map(|(x, y)| Coordinates::new(x, y)).collect();

            let points = plan_positions(count, strategy, &p, &occupied, &mut seeded(seed)).unwrap();

            prop_assert_eq!(points.len(), usize::try_from(count).unwrap());
            let distinct: BTreeSet<_> = points.iter().copied().collect();
            prop_assert_eq!(distinct.len(), points.len());
            for point in &points {
                prop_assert!(p.contains(*point));
                prop_assert!(!occupied.contains(point));
            }
        }

        #[test]
        fn scatter_respects_exclusion_disk(seed in any::<u64>(), exclusion in 1u32..20) {
            let p = params(40, exclusion);
            let points = plan_positions(
                25,
                PlacementStrategy::RandomScatter,
                &p,
                &BTreeSet::new(),
                &mut seeded(seed),
            )
            .unwrap();
            let floor = i64::from(exclusion).pow(2);
            for point in points {
                prop_assert!(point.distance_squared(p.center) >= floor);
            }
        }
    }
}
