//! Approximate planetary positions from mean Keplerian elements.
//!
//! Elements and rates are the JPL "Approximate Positions of the Planets"
//! table for 1800-2050 AD (J2000 ecliptic, rates per Julian century). Accuracy
//! is on the order of arcminutes, which is plenty to flag a bright planet in
//! the field. Positions are geocentric with the Earth-Moon barycenter standing
//! in for the Earth.

use std::f64::consts::PI;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::skybot::julian_date;
use super::{CatalogBackend, CatalogEntry, CatalogError, CatalogTag, SkyRegion};
use crate::sky::SkyPosition;

const J2000_JD: f64 = 2_451_545.0;
const DAYS_PER_CENTURY: f64 = 36_525.0;
const OBLIQUITY_DEG: f64 = 23.43928;

/// Body search radius relative to the region radius. Planets are extended
/// and the elements are approximate, so the cone is widened.
const SEARCH_RADIUS_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Planet {
    Sun,
    Mercury,
    Venus,
    Mars,
    Jupiter,
    Saturn,
    Uranus,
    Neptune,
}

impl Planet {
    pub const ALL: [Planet; 8] = [
        Planet::Sun,
        Planet::Mercury,
        Planet::Venus,
        Planet::Mars,
        Planet::Jupiter,
        Planet::Saturn,
        Planet::Uranus,
        Planet::Neptune,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Planet::Sun => "Sun",
            Planet::Mercury => "Mercury",
            Planet::Venus => "Venus",
            Planet::Mars => "Mars",
            Planet::Jupiter => "Jupiter",
            Planet::Saturn => "Saturn",
            Planet::Uranus => "Uranus",
            Planet::Neptune => "Neptune",
        }
    }

    fn elements(&self) -> Option<&'static Elements> {
        match self {
            Planet::Sun => None,
            Planet::Mercury => Some(&MERCURY),
            Planet::Venus => Some(&VENUS),
            Planet::Mars => Some(&MARS),
            Planet::Jupiter => Some(&JUPITER),
            Planet::Saturn => Some(&SATURN),
            Planet::Uranus => Some(&URANUS),
            Planet::Neptune => Some(&NEPTUNE),
        }
    }
}

/// Mean elements at J2000 and their rates per century.
struct Elements {
    /// Semi-major axis (au).
    a: [f64; 2],
    /// Eccentricity.
    e: [f64; 2],
    /// Inclination (deg).
    i: [f64; 2],
    /// Mean longitude (deg).
    l: [f64; 2],
    /// Longitude of perihelion (deg).
    peri: [f64; 2],
    /// Longitude of the ascending node (deg).
    node: [f64; 2],
}

const MERCURY: Elements = Elements {
    a: [0.38709927, 0.00000037],
    e: [0.20563593, 0.00001906],
    i: [7.00497902, -0.00594749],
    l: [252.25032350, 149472.67411175],
    peri: [77.45779628, 0.16047689],
    node: [48.33076593, -0.12534081],
};

const VENUS: Elements = Elements {
    a: [0.72333566, 0.00000390],
    e: [0.00677672, -0.00004107],
    i: [3.39467605, -0.00078890],
    l: [181.97909950, 58517.81538729],
    peri: [131.60246718, 0.00268329],
    node: [76.67984255, -0.27769418],
};

const EARTH_MOON: Elements = Elements {
    a: [1.00000261, 0.00000562],
    e: [0.01671123, -0.00004392],
    i: [-0.00001531, -0.01294668],
    l: [100.46457166, 35999.37244981],
    peri: [102.93768193, 0.32327364],
    node: [0.0, 0.0],
};

const MARS: Elements = Elements {
    a: [1.52371034, 0.00001847],
    e: [0.09339410, 0.00007882],
    i: [1.84969142, -0.00813131],
    l: [-4.55343205, 19140.30268499],
    peri: [-23.94362959, 0.44441088],
    node: [49.55953891, -0.29257343],
};

const JUPITER: Elements = Elements {
    a: [5.20288700, -0.00011607],
    e: [0.04838624, -0.00013253],
    i: [1.30439695, -0.00183714],
    l: [34.39644051, 3034.74612775],
    peri: [14.72847983, 0.21252668],
    node: [100.47390909, 0.20469106],
};

const SATURN: Elements = Elements {
    a: [9.53667594, -0.00125060],
    e: [0.05386179, -0.00050991],
    i: [2.48599187, 0.00193609],
    l: [49.95424423, 1222.49362201],
    peri: [92.59887831, -0.41897216],
    node: [113.66242448, -0.28867794],
};

const URANUS: Elements = Elements {
    a: [19.18916464, -0.00196176],
    e: [0.04725744, -0.00004397],
    i: [0.77263783, -0.00242939],
    l: [313.23810451, 428.48202785],
    peri: [170.95427630, 0.40805281],
    node: [74.01692503, 0.04240589],
};

const NEPTUNE: Elements = Elements {
    a: [30.06992276, 0.00026291],
    e: [0.00859048, 0.00005105],
    i: [1.77004347, 0.00035372],
    l: [-55.12002969, 218.45945325],
    peri: [44.96476227, -0.32241464],
    node: [131.78422574, -0.00508664],
};

impl Elements {
    /// Heliocentric J2000 ecliptic position (au) at `t` centuries past J2000.
    fn heliocentric(&self, t: f64) -> [f64; 3] {
        let at = |v: [f64; 2]| v[0] + v[1] * t;
        let a = at(self.a);
        let e = at(self.e);
        let i = at(self.i).to_radians();
        let l = at(self.l);
        let peri = at(self.peri);
        let node = at(self.node);

        let omega = (peri - node).to_radians();
        let node = node.to_radians();
        let mean_anomaly = normalize_radians((l - peri).to_radians());
        let ecc_anomaly = solve_kepler(mean_anomaly, e);

        let xp = a * (ecc_anomaly.cos() - e);
        let yp = a * (1.0 - e * e).sqrt() * ecc_anomaly.sin();

        let (so, co) = omega.sin_cos();
        let (sn, cn) = node.sin_cos();
        let (si, ci) = i.sin_cos();

        [
            (co * cn - so * sn * ci) * xp + (-so * cn - co * sn * ci) * yp,
            (co * sn + so * cn * ci) * xp + (-so * sn + co * cn * ci) * yp,
            (so * si) * xp + (co * si) * yp,
        ]
    }
}

fn normalize_radians(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// Solve `E - e sin E = M` by Newton iteration.
fn solve_kepler(mean_anomaly: f64, e: f64) -> f64 {
    let mut ecc = mean_anomaly + e * mean_anomaly.sin();
    for _ in 0..30 {
        let delta = (ecc - e * ecc.sin() - mean_anomaly) / (1.0 - e * ecc.cos());
        ecc -= delta;
        if delta.abs() < 1e-12 {
            break;
        }
    }
    ecc
}

/// Geocentric equatorial position and distance (au) of a body.
pub fn geocentric_position(planet: Planet, at: DateTime<Utc>) -> (SkyPosition, f64) {
    let t = (julian_date(at) - J2000_JD) / DAYS_PER_CENTURY;
    let earth = EARTH_MOON.heliocentric(t);
    let body = planet
        .elements()
        .map(|el| el.heliocentric(t))
        .unwrap_or([0.0; 3]);

    let ecliptic = [body[0] - earth[0], body[1] - earth[1], body[2] - earth[2]];
    let (se, ce) = OBLIQUITY_DEG.to_radians().sin_cos();
    let equatorial = [
        ecliptic[0],
        ecliptic[1] * ce - ecliptic[2] * se,
        ecliptic[1] * se + ecliptic[2] * ce,
    ];
    let distance = equatorial.iter().map(|c| c * c).sum::<f64>().sqrt();

    (
        SkyPosition::from_vector(equatorial).at(Some(at)),
        distance,
    )
}

/// Local ephemeris for the Sun and major planets.
pub struct PlanetEphemeris {
    bodies: Vec<Planet>,
}

impl Default for PlanetEphemeris {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanetEphemeris {
    pub fn new() -> Self {
        Self {
            bodies: Planet::ALL.to_vec(),
        }
    }

    /// Bodies within the widened search cone.
    pub fn bodies_near(&self, region: &SkyRegion, at: DateTime<Utc>) -> Vec<CatalogEntry> {
        let search_radius = region.radius_arcsec * SEARCH_RADIUS_FACTOR;
        self.bodies
            .iter()
            .filter_map(|&planet| {
                let (position, distance_au) = geocentric_position(planet, at);
                let separation = region.center.separation_arcsec(&position);
                (separation <= search_radius).then(|| {
                    CatalogEntry::new(
                        CatalogTag::SolarSystem,
                        position,
                        json!({
                            "name": planet.name(),
                            "body": planet,
                            "distance_au": distance_au,
                            "separation_arcsec": separation,
                        }),
                    )
                })
            })
            .collect()
    }
}

#[async_trait]
impl CatalogBackend for PlanetEphemeris {
    fn tag(&self) -> CatalogTag {
        CatalogTag::SolarSystem
    }

    fn requires_observation_time(&self) -> bool {
        true
    }

    async fn query(&self, region: &SkyRegion) -> Result<Vec<CatalogEntry>, CatalogError> {
        let at = region
            .observed_at
            .ok_or(CatalogError::MissingObservationTime)?;
        Ok(self.bodies_near(region, at))
    }
}
