//! Presentation hook for rendering collaborators
//!
//! The engine never draws anything. A renderer implements [`Theme`] to turn entries
//! into whatever visual representation it works with (markers, text, draw commands).

use crate::{Cluster, Entry, NoisePoint};

/// Turns clusters and noise points into visuals
pub trait Theme<T> {
    type Visual;

    fn present_cluster(&self, cluster: &Cluster<T>, zoom: u8) -> Self::Visual;

    fn present_noise_point(&self, point: &NoisePoint<T>, zoom: u8) -> Self::Visual;
}

/// Present every entry of a query result, in order
pub fn present_entries<T, V: Theme<T> + ?Sized>(
    theme: &V,
    entries: &[Entry<T>],
    zoom: u8,
) -> Vec<V::Visual> {
    entries
        .iter()
        .map(|entry| match entry {
            Entry::Cluster { cluster, .. } => theme.present_cluster(cluster, zoom),
            Entry::Noise { point, .. } => theme.present_noise_point(point, zoom),
        })
        .collect()
}
