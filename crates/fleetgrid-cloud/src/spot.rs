//! Spot billing: price history → hourly billing rates → cost over a range.
//!
//! Spot instances are billed per hour at the market price in effect when
//! each hour starts. The provider reports price *changes* at irregular
//! times, newest first and paginated, so the history is first replayed
//! into one rate per billing hour from the instance's launch time, and a
//! cost for any window is then integrated across those hourly rates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CloudError, CloudResult};
use crate::provider::{CloudProvider, SpotPriceFilter, SpotPriceSample};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// The price billed for the hour starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotRate {
    pub start: DateTime<Utc>,
    pub price: f64,
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MILLIS_PER_HOUR
}

/// Cost of an on-demand instance over `[start, end)`.
pub fn on_demand_cost(hourly_price: f64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    if end <= start {
        return 0.0;
    }
    hourly_price * hours_between(start, end)
}

/// Replay price history into one rate per hour from `launch` until the
/// hour boundary passes `end`.
///
/// Each boundary takes the most recent sample at or before it. A boundary
/// earlier than every sample takes the earliest sample. Empty history
/// yields no rates.
pub fn hourly_rates(
    history: &[SpotPriceSample],
    launch: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<SpotRate> {
    // Providers return newest first.
    let mut ascending: Vec<&SpotPriceSample> = history.iter().rev().collect();
    ascending.sort_by_key(|s| s.timestamp);

    let mut rates = Vec::new();
    if ascending.is_empty() {
        return rates;
    }

    let mut idx = 0;
    let mut boundary = launch;
    while boundary <= end {
        while idx + 1 < ascending.len() && ascending[idx + 1].timestamp <= boundary {
            idx += 1;
        }
        rates.push(SpotRate {
            start: boundary,
            price: ascending[idx].price,
        });
        boundary += ChronoDuration::hours(1);
    }
    rates
}

/// Integrate the cost of `[start, end)` over ascending hourly `rates`.
///
/// Buckets wholly before `start` are skipped. Time before the first
/// bucket is charged at the first bucket's price, and time after the last
/// bucket's start at the last bucket's price.
pub fn spot_cost_for_range(start: DateTime<Utc>, end: DateTime<Utc>, rates: &[SpotRate]) -> f64 {
    if end <= start {
        return 0.0;
    }
    let mut cost = 0.0;
    let mut cur = start;
    for (i, rate) in rates.iter().enumerate() {
        let next = rates.get(i + 1);
        if let Some(next) = next {
            if cur > next.start {
                continue;
            }
        }
        match next {
            Some(next) if end >= next.start => {
                cost += hours_between(cur, next.start) * rate.price;
                cur = next.start;
            }
            _ => {
                cost += hours_between(cur, end) * rate.price;
                break;
            }
        }
    }
    cost
}

/// Fetch every page of spot price history matching `filter`.
pub async fn fetch_history(
    provider: &dyn CloudProvider,
    filter: &SpotPriceFilter,
) -> CloudResult<Vec<SpotPriceSample>> {
    let mut filter = filter.clone();
    let mut history = Vec::new();
    let mut pages = 0u32;
    loop {
        let page = provider.describe_spot_price_history(&filter).await?;
        pages += 1;
        history.extend(page.samples);
        match page.next_token {
            Some(token) if !token.is_empty() => filter.next_token = Some(token),
            _ => break,
        }
    }
    debug!(
        instance_type = %filter.instance_type,
        samples = history.len(),
        pages,
        "spot price history fetched"
    );
    Ok(history)
}

/// Hourly billing rates of a spot instance launched at `launch` in `zone`,
/// covering up to `end`.
pub async fn hourly_spot_rates(
    provider: &dyn CloudProvider,
    instance_type: &str,
    product: &str,
    zone: &str,
    launch: DateTime<Utc>,
    end: DateTime<Utc>,
) -> CloudResult<Vec<SpotRate>> {
    let filter = SpotPriceFilter {
        instance_type: instance_type.to_string(),
        product_description: product.to_string(),
        zone: Some(zone.to_string()),
        // Widen by an hour each side so the price in effect at launch is included.
        start_time: Some(launch - ChronoDuration::hours(1)),
        end_time: Some(end + ChronoDuration::hours(1)),
        next_token: None,
    };
    let history = fetch_history(provider, &filter).await?;
    if history.is_empty() {
        return Err(CloudError::NoSpotPrices {
            instance_type: instance_type.to_string(),
            product: product.to_string(),
        });
    }
    Ok(hourly_rates(&history, launch, end))
}

/// Lowest current spot price across zones, with the zone offering it.
pub async fn latest_lowest_spot_price(
    provider: &dyn CloudProvider,
    instance_type: &str,
    product: &str,
) -> CloudResult<(f64, String)> {
    let filter = SpotPriceFilter {
        instance_type: instance_type.to_string(),
        product_description: product.to_string(),
        zone: None,
        // A start time in the future returns only the latest sample per zone.
        start_time: Some(Utc::now() + ChronoDuration::hours(24)),
        end_time: None,
        next_token: None,
    };
    let samples = fetch_history(provider, &filter).await?;

    let mut lowest: Option<&SpotPriceSample> = None;
    for sample in &samples {
        if !sample.price.is_finite() || sample.price < 0.0 {
            return Err(CloudError::InvalidSpotPrice(sample.price.to_string()));
        }
        if lowest.is_none_or(|l| sample.price < l.price) {
            lowest = Some(sample);
        }
    }
    lowest
        .map(|s| (s.price, s.zone.clone()))
        .ok_or_else(|| CloudError::NoSpotPrices {
            instance_type: instance_type.to_string(),
            product: product.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn mins(m: i64) -> ChronoDuration {
        ChronoDuration::minutes(m)
    }

    fn sample(at: DateTime<Utc>, price: f64) -> SpotPriceSample {
        SpotPriceSample {
            zone: "us-east-1a".to_string(),
            price,
            timestamp: at,
        }
    }

    fn two_rates() -> Vec<SpotRate> {
        vec![
            SpotRate { start: t0(), price: 1.0 },
            SpotRate { start: t0() + mins(60), price: 2.0 },
        ]
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn on_demand_three_hours() {
        assert_eq!(on_demand_cost(0.5, t0(), t0() + mins(180)), 1.5);
        assert_eq!(on_demand_cost(0.5, t0(), t0()), 0.0);
    }

    #[test]
    fn range_spanning_one_boundary() {
        let cost = spot_cost_for_range(t0(), t0() + mins(90), &two_rates());
        assert!(approx(cost, 2.0));
    }

    #[test]
    fn empty_range_costs_nothing() {
        assert_eq!(spot_cost_for_range(t0(), t0(), &two_rates()), 0.0);
        assert_eq!(spot_cost_for_range(t0() + mins(30), t0(), &two_rates()), 0.0);
    }

    #[test]
    fn range_within_one_bucket() {
        let cost = spot_cost_for_range(t0() + mins(10), t0() + mins(40), &two_rates());
        assert!(approx(cost, 0.5));
    }

    #[test]
    fn range_starting_and_ending_on_boundaries() {
        let rates = vec![
            SpotRate { start: t0(), price: 1.0 },
            SpotRate { start: t0() + mins(60), price: 2.0 },
            SpotRate { start: t0() + mins(120), price: 4.0 },
        ];
        assert!(approx(spot_cost_for_range(t0(), t0() + mins(60), &rates), 1.0));
        assert!(approx(spot_cost_for_range(t0() + mins(60), t0() + mins(120), &rates), 2.0));
        assert!(approx(spot_cost_for_range(t0(), t0() + mins(180), &rates), 7.0));
    }

    #[test]
    fn range_after_all_boundaries_uses_last_price() {
        let cost = spot_cost_for_range(t0() + mins(120), t0() + mins(150), &two_rates());
        assert!(approx(cost, 1.0));
    }

    #[test]
    fn cost_is_additive_across_split_points() {
        let rates = vec![
            SpotRate { start: t0(), price: 0.3 },
            SpotRate { start: t0() + mins(60), price: 0.7 },
            SpotRate { start: t0() + mins(120), price: 0.2 },
            SpotRate { start: t0() + mins(180), price: 0.9 },
        ];
        let start = t0() + mins(15);
        let end = t0() + mins(200);
        let whole = spot_cost_for_range(start, end, &rates);
        for split in [20, 59, 60, 61, 119, 150, 180, 199] {
            let mid = t0() + mins(split);
            let parts =
                spot_cost_for_range(start, mid, &rates) + spot_cost_for_range(mid, end, &rates);
            assert!(approx(whole, parts), "split at {split}m: {whole} != {parts}");
        }
    }

    #[test]
    fn bucketing_emits_one_rate_per_hour() {
        // Newest first, as providers return it.
        let history = vec![
            sample(t0() + mins(150), 0.40),
            sample(t0() + mins(70), 0.30),
            sample(t0() + mins(20), 0.20),
            sample(t0() - mins(30), 0.10),
        ];
        let rates = hourly_rates(&history, t0(), t0() + mins(180));
        let prices: Vec<f64> = rates.iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![0.10, 0.20, 0.30, 0.40]);
        assert_eq!(rates[0].start, t0());
        assert_eq!(rates[3].start, t0() + mins(180));
    }

    #[test]
    fn bucketing_repeats_unchanged_price() {
        let history = vec![sample(t0() - mins(5), 0.25)];
        let rates = hourly_rates(&history, t0(), t0() + mins(150));
        assert_eq!(rates.len(), 3);
        assert!(rates.iter().all(|r| r.price == 0.25));
    }

    #[test]
    fn bucketing_sample_exactly_on_boundary_applies() {
        let history = vec![sample(t0() + mins(60), 0.9), sample(t0() - mins(1), 0.1)];
        let rates = hourly_rates(&history, t0(), t0() + mins(60));
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[1].price, 0.9);
    }

    #[test]
    fn bucketing_before_history_carries_earliest_forward() {
        let history = vec![sample(t0() + mins(90), 0.5), sample(t0() + mins(30), 0.2)];
        let rates = hourly_rates(&history, t0(), t0() + mins(120));
        let prices: Vec<f64> = rates.iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![0.2, 0.2, 0.5]);
    }

    #[test]
    fn bucketing_empty_history_is_empty() {
        assert!(hourly_rates(&[], t0(), t0() + mins(120)).is_empty());
    }
}
