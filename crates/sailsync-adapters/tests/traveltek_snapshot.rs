use std::path::{Path, PathBuf};

use sailsync_adapters::{read_payload_file, ParseOptions};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct GoldenPrices {
    interior: Option<f64>,
    oceanview: Option<f64>,
    balcony: Option<f64>,
    suite: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GoldenRecord {
    file: String,
    supplier_item_id: Option<String>,
    ship_id: Option<i32>,
    sailing_date: Option<String>,
    voyage_code: Option<String>,
    prices: Option<GoldenPrices>,
    cheapest_price: Option<f64>,
    char_indexed: bool,
    corrupt: bool,
}

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/traveltek/sample")
}

#[test]
fn traveltek_sample_matches_golden_snapshot() {
    let text = std::fs::read_to_string(sample_dir().join("snapshot.json")).expect("read snapshot");
    let golden: Vec<GoldenRecord> = serde_json::from_str(&text).expect("parse snapshot");
    assert!(!golden.is_empty());

    for expected in golden {
        let result = read_payload_file(sample_dir().join(&expected.file), ParseOptions::default());
        if expected.corrupt {
            assert!(result.is_err(), "{} should be corrupt", expected.file);
            continue;
        }
        let parsed = result.unwrap_or_else(|err| panic!("{}: {err:#}", expected.file));
        let record = &parsed.record;

        assert_eq!(Some(record.supplier_item_id.clone()), expected.supplier_item_id);
        assert_eq!(Some(record.ship_id), expected.ship_id);
        assert_eq!(Some(record.sailing_date.to_string()), expected.sailing_date);
        assert_eq!(Some(record.voyage_code.clone()), expected.voyage_code);
        assert_eq!(record.cheapest_price, expected.cheapest_price);
        assert_eq!(parsed.char_indexed(), expected.char_indexed, "{}", expected.file);

        let prices = expected.prices.expect("golden prices");
        assert_eq!(record.prices.interior, prices.interior);
        assert_eq!(record.prices.oceanview, prices.oceanview);
        assert_eq!(record.prices.balcony, prices.balcony);
        assert_eq!(record.prices.suite, prices.suite);
    }
}

#[test]
fn disabling_repair_rejects_char_indexed_sample() {
    let result = read_payload_file(
        sample_dir().join("char_indexed.json"),
        ParseOptions {
            repair_char_indexed: false,
        },
    );
    assert!(result.is_err());
}
