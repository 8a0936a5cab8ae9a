use crate::{
    api::model::TrackModelApi,
    core::error::ValidationError,
    math::geo::is_valid_position,
    model::map::{ColorTag, PolylineNode, TrackSegment},
};
use log::trace;

/// Builds the colored polyline of the active trip.
#[derive(Debug, Default)]
pub struct MapTrackBuilder {
    nodes: Vec<PolylineNode>,
}

impl MapTrackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one node. Nodes are kept in arrival order.
    pub fn append(
        &mut self,
        latitude: f64,
        longitude: f64,
        fuel_consumption: f64,
        color: ColorTag,
    ) -> Result<(), ValidationError> {
        if !is_valid_position([latitude, longitude]) {
            return Err(ValidationError::InvalidCoordinate {
                latitude,
                longitude,
            });
        }
        trace!("Track node {:?} at ({}, {})", color, latitude, longitude);
        self.nodes.push(PolylineNode::new(
            color,
            latitude,
            longitude,
            fuel_consumption,
        ));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Position of the most recent node.
    pub fn last_position(&self) -> Option<[f64; 2]> {
        self.nodes.last().map(|n| [n.latitude(), n.longitude()])
    }
}

impl TrackModelApi for MapTrackBuilder {
    fn get_nodes(&self) -> &[PolylineNode] {
        &self.nodes
    }

    fn get_segments(&self) -> Vec<TrackSegment> {
        self.nodes
            .windows(2)
            .map(|pair| TrackSegment {
                color: pair[0].color(),
                from: [pair[0].latitude(), pair[0].longitude()],
                to: [pair[1].latitude(), pair[1].longitude()],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_order() {
        let mut track = MapTrackBuilder::new();
        track.append(48.2, 16.3, 4.0, ColorTag::Green).unwrap();
        track.append(48.21, 16.31, 9.0, ColorTag::Yellow).unwrap();
        track.append(48.22, 16.32, 25.0, ColorTag::Black).unwrap();

        let colors: Vec<_> = track.get_nodes().iter().map(|n| n.color()).collect();
        assert_eq!(colors, vec![ColorTag::Green, ColorTag::Yellow, ColorTag::Black]);
        assert_eq!(track.last_position(), Some([48.22, 16.32]));

        let segments = track.get_segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].color, ColorTag::Green);
        assert_eq!(segments[1].from, [48.21, 16.31]);
        assert_eq!(segments[1].to, [48.22, 16.32]);
    }

    #[test]
    fn test_invalid_coordinates_are_rejected() {
        let mut track = MapTrackBuilder::new();
        assert!(matches!(
            track.append(f64::NAN, 16.3, 1.0, ColorTag::Green),
            Err(ValidationError::InvalidCoordinate { .. })
        ));
        assert!(track.append(48.2, f64::INFINITY, 1.0, ColorTag::Green).is_err());
        assert!(track.append(91.0, 16.3, 1.0, ColorTag::Green).is_err());
        assert!(track.get_nodes().is_empty());
    }

    #[test]
    fn test_clear() {
        let mut track = MapTrackBuilder::new();
        track.append(48.2, 16.3, 1.0, ColorTag::Green).unwrap();
        track.clear();
        assert!(track.get_nodes().is_empty());
        assert!(track.get_segments().is_empty());
        assert!(track.last_position().is_none());
    }
}
