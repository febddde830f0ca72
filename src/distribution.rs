//! Classification of weighted value distributions into map legend stops.

use anyhow::{Result, bail};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// One aggregated input pair, e.g. miles of road at an integer speed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub value: f64,
    pub count: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub lower: f64,
    pub upper: f64,
    pub count: f64,
}

/// Legend for one metric, in the shape the dashboard consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub stops: Vec<Stop>,
}

impl Classification {
    fn empty() -> Self {
        Self {
            min: None,
            max: None,
            stops: Vec::new(),
        }
    }
}

/// How quantile cut points are moved before formatting
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Adjustment {
    /// Arithmetic sequence with the mean quantile gap as step
    #[default]
    Equal,
    /// Mirror cut points around a pivot value
    Center(f64),
}

#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    /// Target cumulative percentiles for the `n - 1` cut points.
    /// Evenly spaced when unset.
    pub profile: Option<Vec<f64>>,
    pub adjustment: Adjustment,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CumulativeBin {
    value: f64,
    count: f64,
    percentile: f64,
}

/// A stop of the equal-width search, with its cumulative percentile
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredStop {
    pub lower: f64,
    pub upper: f64,
    pub count: f64,
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFit {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub score: f64,
    pub stops: Vec<ScoredStop>,
}

/// Weighted empirical distribution with its cumulative percentile curve
#[derive(Debug, Clone)]
pub struct Distribution {
    data: Vec<CumulativeBin>,
    total: f64,
}

impl Distribution {
    pub fn new(bins: &[Bin]) -> Self {
        let mut sorted = bins.to_vec();
        sorted.sort_by_key(|bin| OrderedFloat(bin.value));

        let total: f64 = sorted.iter().map(|bin| bin.count).sum();
        let mut running = 0.0;
        let data = sorted
            .into_iter()
            .map(|bin| {
                running += bin.count;
                CumulativeBin {
                    value: bin.value,
                    count: bin.count,
                    percentile: if total > 0.0 { running / total } else { 0.0 },
                }
            })
            .collect();

        Self { data, total }
    }

    pub fn min(&self) -> Option<f64> {
        self.data.first().map(|bin| bin.value)
    }

    pub fn max(&self) -> Option<f64> {
        self.data.last().map(|bin| bin.value)
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Fit `n` stops to the distribution
    pub fn fit(&self, n: usize, options: &FitOptions) -> Result<Classification> {
        if self.data.is_empty() {
            return Ok(Classification::empty());
        }
        if n == 0 {
            bail!("Cannot fit zero stops");
        }

        let profile = match &options.profile {
            Some(profile) => profile.clone(),
            None => (1..n).map(|i| i as f64 / n as f64).collect(),
        };
        if profile.len() != n - 1 {
            bail!(
                "Profile length must be equal to n - 1 (got {} for n = {})",
                profile.len(),
                n
            );
        }

        let quantiles = self.quantiles(&profile);
        let cuts = self.adjust(&quantiles, options.adjustment);
        Ok(self.format(&cuts))
    }

    /// Nearest data value for each target percentile
    pub fn quantiles(&self, profile: &[f64]) -> Vec<f64> {
        let Some(last) = self.data.last() else {
            return Vec::new();
        };

        let mut i = 0;
        profile
            .iter()
            .map(|&pct| {
                while i < self.data.len() && self.data[i].percentile < pct {
                    i += 1;
                }
                if i == self.data.len() {
                    return last.value;
                }
                if i == 0 || self.data[i].percentile - pct < pct - self.data[i - 1].percentile {
                    self.data[i].value
                } else {
                    self.data[i - 1].value
                }
            })
            .collect()
    }

    pub fn adjust(&self, quantiles: &[f64], adjustment: Adjustment) -> Vec<f64> {
        match adjustment {
            Adjustment::Equal => self.equal_steps(quantiles),
            Adjustment::Center(center) => mirror_around(center, quantiles),
        }
    }

    fn equal_steps(&self, quantiles: &[f64]) -> Vec<f64> {
        let (Some(min), Some(max)) = (self.min(), self.max()) else {
            return quantiles.to_vec();
        };
        let Some(&first) = quantiles.first() else {
            return Vec::new();
        };

        // The first cut must leave weight below it
        let start = if first > min { first } else { first + 1.0 };
        if quantiles.len() < 2 {
            return vec![start];
        }

        let steps = (quantiles.len() - 1) as f64;
        let span: f64 = quantiles.windows(2).map(|w| w[1] - w[0]).sum();
        let mut size = (span / steps).round();
        while size > 1.0 && start + size * steps >= max {
            size -= 1.0;
        }

        (0..quantiles.len())
            .map(|i| start + size * i as f64)
            .collect()
    }

    /// Contiguous stops from `min` to `max + 1` split at `cuts`.
    ///
    /// A stop without weight is folded into the next stop holding weight, or
    /// into the previous one when nothing follows, so the ranges stay gapless.
    pub fn format(&self, cuts: &[f64]) -> Classification {
        let (Some(min), Some(max)) = (self.min(), self.max()) else {
            return Classification::empty();
        };

        let mut uppers = cuts.to_vec();
        uppers.push(max + 1.0);

        let mut stops: Vec<Stop> = Vec::with_capacity(uppers.len());
        let mut lower = min;
        let mut i = 0;
        for upper in uppers {
            let mut count = 0.0;
            while i < self.data.len() && self.data[i].value < upper {
                count += self.data[i].count;
                i += 1;
            }
            if count > 0.0 {
                stops.push(Stop {
                    lower,
                    upper,
                    count,
                });
                lower = upper;
            }
        }
        if let Some(last) = stops.last_mut() {
            last.upper = max + 1.0;
        }

        Classification {
            min: Some(min),
            max: Some(max),
            stops,
        }
    }

    /// Brute-force equal-width classification: every integer step size and
    /// start is tried, keeping the stops whose cumulative percentiles are
    /// closest to an even split.
    pub fn search(&self, n: usize, zero_based: bool) -> Result<SearchFit> {
        let (Some(min), Some(max)) = (self.min(), self.max()) else {
            return Ok(SearchFit {
                min: None,
                max: None,
                score: -1.0,
                stops: Vec::new(),
            });
        };
        if n < 2 {
            bail!("Equal-width search needs at least two stops");
        }

        let mut best = SearchFit {
            min: Some(min),
            max: Some(max),
            score: -1.0,
            stops: Vec::new(),
        };
        let mut consider = |stops: Vec<ScoredStop>| {
            let score = score_stops(&stops, n);
            if score > best.score {
                best.score = score;
                best.stops = stops;
            }
        };

        let max_size = ((max - min) / n as f64).ceil().max(0.0) as u64;
        let inner = (n - 2) as f64;
        for size in 1..=max_size {
            let size = size as f64;
            if zero_based {
                consider(self.equal_width_stops(n, size, size, 0.0));
            } else {
                let mut start = min;
                while start + size * inner < max {
                    consider(self.equal_width_stops(n, size, start, min));
                    start += 1.0;
                }
            }
        }

        Ok(best)
    }

    fn equal_width_stops(&self, n: usize, size: f64, start: f64, base: f64) -> Vec<ScoredStop> {
        let max = self.max().unwrap_or(base);
        let mut bounds = vec![base];
        bounds.extend((0..n - 1).map(|i| start + size * i as f64));

        let mut i = 0;
        let mut cumulative = 0.0;
        (0..n)
            .map(|s| {
                let upper = bounds.get(s + 1).copied().unwrap_or(f64::INFINITY);
                let mut count = 0.0;
                while i < self.data.len() && self.data[i].value < upper {
                    count += self.data[i].count;
                    i += 1;
                }
                cumulative += count;
                ScoredStop {
                    lower: bounds[s],
                    upper: if s == n - 1 { max } else { upper },
                    count,
                    percentile: if self.total > 0.0 {
                        cumulative / self.total
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

fn score_stops(stops: &[ScoredStop], n: usize) -> f64 {
    1.0 - stops
        .iter()
        .enumerate()
        .map(|(i, stop)| (stop.percentile - (i + 1) as f64 / n as f64).abs())
        .sum::<f64>()
}

fn mirror_around(center: f64, quantiles: &[f64]) -> Vec<f64> {
    let len = quantiles.len();
    let offsets: Vec<f64> = quantiles.iter().map(|q| (center - q).abs()).collect();
    let mirror: Vec<f64> = (0..len / 2)
        .map(|i| ((offsets[i] + offsets[len - 1 - i]) / 2.0).floor())
        .collect();

    let mut cuts: Vec<f64> = mirror.iter().map(|m| center - m).collect();
    if len % 2 == 1 {
        cuts.push(center);
    }
    cuts.extend(mirror.iter().rev().map(|m| center + m));
    cuts
}

/// Input bins of the four edge metrics shown on the explore map
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EdgeBins {
    pub speed: Vec<Bin>,
    pub trips: Vec<Bin>,
    pub users: Vec<Bin>,
    pub preference: Vec<Bin>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeStatistics {
    pub speed: Classification,
    pub trips: Classification,
    pub users: Classification,
    pub preference: Classification,
}

/// Legends for the explore map. Preference diverges around zero, so its
/// outer stops sit in the tails.
pub fn edge_statistics(bins: &EdgeBins) -> Result<EdgeStatistics> {
    let equal = FitOptions::default();
    let preference = FitOptions {
        profile: Some(vec![0.05, 0.1, 0.9, 0.95]),
        adjustment: Adjustment::Center(0.0),
    };

    Ok(EdgeStatistics {
        speed: Distribution::new(&bins.speed).fit(5, &equal)?,
        trips: Distribution::new(&bins.trips).fit(5, &equal)?,
        users: Distribution::new(&bins.users).fit(5, &equal)?,
        preference: Distribution::new(&bins.preference).fit(5, &preference)?,
    })
}
