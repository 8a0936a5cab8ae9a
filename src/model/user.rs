//! User Model
//!
//! Profile data shown on the ranking and profile screens: cumulative
//! eco-points plus a fixed set of ranking cards.

use super::trip::Trip;
use serde::{Deserialize, Serialize};

/// Icon shown next to a ranking card value. Resolved to an image by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankingIcon {
    EcoPoints,
    Co2,
    Trips,
    Distance,
    Cars,
    FuelType,
    AvgSpeed,
    AvgRpm,
}

/// The fixed card groups, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankingCategory {
    EcoPointsAndCo2,
    TripsAndDistance,
    CarsAndFuelType,
    AvgSpeedAndAvgRpm,
}

impl RankingCategory {
    pub const ALL: [RankingCategory; 4] = [
        RankingCategory::EcoPointsAndCo2,
        RankingCategory::TripsAndDistance,
        RankingCategory::CarsAndFuelType,
        RankingCategory::AvgSpeedAndAvgRpm,
    ];
}

/// One value/label/icon triple of a ranking card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardContent {
    pub value: String,
    pub label: String,
    pub icon: RankingIcon,
}

impl CardContent {
    fn new(value: String, label: &str, icon: RankingIcon) -> Self {
        Self {
            value,
            label: label.to_owned(),
            icon,
        }
    }
}

/// Two cards belonging to the same category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingGroup {
    pub category: RankingCategory,
    pub cards: [CardContent; 2],
}

/// Aggregated driving statistics of a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub trips: u32,
    pub distance_km: f64,
    pub cars: u32,
    pub fuel_type: String,
    /// Distance-weighted average speed over all trips, km/h.
    pub avg_speed_kmh: f64,
    /// Trip-weighted average engine speed, 1/min.
    pub avg_rpm: f64,
    /// CO₂ emitted in kg, supplied by the backend.
    pub co2_kg: Option<f64>,
}

/// An EcoPoints user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub user_name: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub eco_points: f64,
    pub stats: UserStats,
}

impl User {
    pub fn new(id: i64, user_name: &str, password: &str, eco_points: f64) -> Self {
        Self {
            id,
            user_name: user_name.to_owned(),
            password: password.to_owned(),
            eco_points,
            stats: UserStats::default(),
        }
    }

    /// Folds a finished trip into the cumulative profile values.
    pub fn record_trip(&mut self, trip: &Trip) {
        let previous_trips = self.stats.trips as f64;
        let previous_distance = self.stats.distance_km;
        let total_distance = previous_distance + trip.distance_km();

        self.eco_points += trip.eco_points();
        self.stats.trips += 1;
        self.stats.distance_km = total_distance;
        self.stats.avg_rpm =
            (self.stats.avg_rpm * previous_trips + trip.avg_rpm()) / (previous_trips + 1.0);
        if total_distance > 0.0 {
            self.stats.avg_speed_kmh = (self.stats.avg_speed_kmh * previous_distance
                + trip.avg_speed_kmh() * trip.distance_km())
                / total_distance;
        }
    }

    /// Ranking cards for this user, see [`build_ranking_cards`].
    pub fn ranking_cards(&self) -> Vec<RankingGroup> {
        build_ranking_cards(self)
    }
}

/// Builds the ranking card groups in [`RankingCategory::ALL`] order.
pub fn build_ranking_cards(user: &User) -> Vec<RankingGroup> {
    let stats = &user.stats;
    RankingCategory::ALL
        .iter()
        .map(|category| {
            let cards = match category {
                RankingCategory::EcoPointsAndCo2 => [
                    CardContent::new(
                        format!("{:.1}", user.eco_points),
                        "Eco-Points",
                        RankingIcon::EcoPoints,
                    ),
                    CardContent::new(
                        stats
                            .co2_kg
                            .map(|kg| format!("{:.1} kg", kg))
                            .unwrap_or_else(|| "-".to_owned()),
                        "CO₂-Consumption",
                        RankingIcon::Co2,
                    ),
                ],
                RankingCategory::TripsAndDistance => [
                    CardContent::new(stats.trips.to_string(), "Trips", RankingIcon::Trips),
                    CardContent::new(
                        format!("{:.0} km", stats.distance_km),
                        "Distance",
                        RankingIcon::Distance,
                    ),
                ],
                RankingCategory::CarsAndFuelType => [
                    CardContent::new(stats.cars.to_string(), "Cars", RankingIcon::Cars),
                    CardContent::new(
                        stats.fuel_type.clone(),
                        "Fuel Type",
                        RankingIcon::FuelType,
                    ),
                ],
                RankingCategory::AvgSpeedAndAvgRpm => [
                    CardContent::new(
                        format!("{:.0} km/h", stats.avg_speed_kmh),
                        "Avg. Speed",
                        RankingIcon::AvgSpeed,
                    ),
                    CardContent::new(
                        format!("{:.0}", stats.avg_rpm),
                        "Avg. RPM",
                        RankingIcon::AvgRpm,
                    ),
                ],
            };
            RankingGroup {
                category: *category,
                cards,
            }
        })
        .collect()
}
