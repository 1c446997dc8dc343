//! Spatial ordering of the tracked population.
//!
//! All pairwise distances are computed once; both the loneliness ordering and
//! the designated neighbour of every sensor are read from that matrix.

use std::cmp::Ordering;

use crate::model::{Coordinate, Sensor};

/// Symmetric all-pairs Euclidean distance matrix.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    size: usize,
    cells: Vec<f64>,
}

impl DistanceMatrix {
    /// Computes every pairwise distance.
    #[must_use]
    pub fn new(points: &[Coordinate]) -> Self {
        let size = points.len();
        let mut cells = vec![0.0; size * size];
        for i in 0..size {
            for j in (i + 1)..size {
                let d = points[i].distance(&points[j]);
                cells[i * size + j] = d;
                cells[j * size + i] = d;
            }
        }
        Self { size, cells }
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when built from no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Distance between points `i` and `j`.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.cells[i * self.size + j]
    }

    /// Sum of distances from `i` to every other point.
    #[must_use]
    pub fn loneliness(&self, i: usize) -> f64 {
        self.cells[i * self.size..(i + 1) * self.size].iter().sum()
    }
}

/// Sensor positioned in the tracking order.
#[derive(Debug, Clone)]
pub struct PlacedSensor {
    /// The sensor.
    pub sensor: Sensor,
    /// Sum of distances to every other tracked sensor.
    pub loneliness: f64,
    /// Index (into the ordered list) of the nearest other sensor.
    pub neighbour: Option<usize>,
}

/// Orders sensors loneliest first and designates each one's nearest neighbour.
///
/// Ties in loneliness keep input order; ties in neighbour distance pick the
/// earlier position.
#[must_use]
pub fn arrange(sensors: Vec<Sensor>) -> Vec<PlacedSensor> {
    let points: Vec<Coordinate> = sensors.iter().map(|s| s.position).collect();
    let matrix = DistanceMatrix::new(&points);
    let loneliness: Vec<f64> = (0..matrix.len()).map(|i| matrix.loneliness(i)).collect();

    let mut order: Vec<usize> = (0..sensors.len()).collect();
    order.sort_by(|&a, &b| loneliness[b].total_cmp(&loneliness[a]));

    let neighbours: Vec<Option<usize>> = order
        .iter()
        .enumerate()
        .map(|(pos, &orig)| {
            order
                .iter()
                .enumerate()
                .filter(|&(other_pos, _)| other_pos != pos)
                .min_by(|&(pa, &a), &(pb, &b)| {
                    match matrix.get(orig, a).total_cmp(&matrix.get(orig, b)) {
                        Ordering::Equal => pa.cmp(&pb),
                        unequal => unequal,
                    }
                })
                .map(|(other_pos, _)| other_pos)
        })
        .collect();

    let mut slots: Vec<Option<Sensor>> = sensors.into_iter().map(Some).collect();
    order
        .iter()
        .zip(neighbours)
        .filter_map(|(&orig, neighbour)| {
            slots[orig].take().map(|sensor| PlacedSensor {
                sensor,
                loneliness: loneliness[orig],
                neighbour,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    fn sensor_at(x: f64, y: f64, z: f64) -> Sensor {
        Sensor::new(
            Uuid::nil(),
            0,
            Coordinate::new(x, y, z),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn matrix_is_symmetric_with_zero_diagonal() {
        let points = [
            Coordinate::new(0.0, 0.0, 0.0),
            Coordinate::new(1.0, 0.0, 0.0),
            Coordinate::new(0.0, 2.0, 0.0),
        ];
        let matrix = DistanceMatrix::new(&points);
        for i in 0..3 {
            assert!(matrix.get(i, i).abs() < f64::EPSILON);
            for j in 0..3 {
                assert!((matrix.get(i, j) - matrix.get(j, i)).abs() < f64::EPSILON);
            }
        }
        assert!((matrix.loneliness(0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn loneliest_sensor_comes_first() {
        let cluster_a = sensor_at(0.0, 0.0, 0.0);
        let cluster_b = sensor_at(1.0, 0.0, 0.0);
        let cluster_c = sensor_at(0.0, 1.0, 0.0);
        let outlier = sensor_at(500.0, 500.0, 500.0);
        let outlier_id = outlier.id;

        let placed = arrange(vec![cluster_a, cluster_b, outlier, cluster_c]);
        assert_eq!(placed.len(), 4);
        assert_eq!(placed[0].sensor.id, outlier_id);
        for pair in placed.windows(2) {
            assert!(pair[0].loneliness >= pair[1].loneliness);
        }
    }

    #[test]
    fn neighbour_is_the_nearest_other_sensor() {
        let a = sensor_at(0.0, 0.0, 0.0);
        let b = sensor_at(2.0, 0.0, 0.0);
        let c = sensor_at(100.0, 0.0, 0.0);
        let (a_id, b_id) = (a.id, b.id);

        let placed = arrange(vec![a, b, c]);
        let position = |id| placed.iter().position(|p| p.sensor.id == id).unwrap();
        let c_pos = placed
            .iter()
            .position(|p| p.sensor.id != a_id && p.sensor.id != b_id)
            .unwrap();

        assert_eq!(placed[position(a_id)].neighbour, Some(position(b_id)));
        assert_eq!(placed[position(b_id)].neighbour, Some(position(a_id)));
        assert_eq!(placed[c_pos].neighbour, Some(position(b_id)));
        assert!(placed.iter().enumerate().all(|(i, p)| p.neighbour != Some(i)));
    }

    #[test]
    fn single_sensor_has_no_neighbour() {
        let placed = arrange(vec![sensor_at(1.0, 1.0, 1.0)]);
        assert_eq!(placed[0].neighbour, None);
        assert!(arrange(Vec::new()).is_empty());
    }

    #[test]
    fn arrangement_is_deterministic() {
        let sensors: Vec<Sensor> = (0..6)
            .map(|i| sensor_at(f64::from(i) * 3.0, f64::from(i % 2), 0.0))
            .collect();
        let first: Vec<_> = arrange(sensors.clone())
            .into_iter()
            .map(|p| (p.sensor.id, p.neighbour))
            .collect();
        let second: Vec<_> = arrange(sensors)
            .into_iter()
            .map(|p| (p.sensor.id, p.neighbour))
            .collect();
        assert_eq!(first, second);
    }
}
