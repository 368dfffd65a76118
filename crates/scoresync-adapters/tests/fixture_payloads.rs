use std::path::{Path, PathBuf};

use scoresync_adapters::{extract_standings, FixtureSportsApi, ShapeError, SportsApi};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/api")
}

#[test]
fn fixture_layout_exists() {
    let root = fixtures_root();
    assert!(root.join("competitions.json").exists());
    assert!(root.join("standings/7.json").exists());
}

#[tokio::test]
async fn captured_standings_without_rows_yield_shape_error() {
    let api = FixtureSportsApi::new(fixtures_root());
    let payload = api.standings(8).await.expect("fixture for 8");
    assert_eq!(extract_standings(&payload, 8), Err(ShapeError::MissingRows));
}

#[tokio::test]
async fn captured_listing_links_competitions_to_known_countries() {
    let api = FixtureSportsApi::new(fixtures_root());
    let listing = api.competitions().await.expect("competitions fixture");
    let countries: Vec<i64> = listing.countries().iter().map(|c| c.id).collect();
    for competition in listing.competitions() {
        let country = competition.country_id.expect("fixture competitions carry a country");
        assert!(countries.contains(&country));
    }
}
