use dmf_config::load_capacitance_csv;
use std::io::Write;

fn write_csv(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("tempfile");
    f.write_all(content.as_bytes()).expect("write");
    f.flush().expect("flush");
    f
}

#[test]
fn loads_a_well_formed_curve() {
    let f = write_csv("frequency,capacitance\n100,3.1e-12\n1000,2.9e-12\n10000,2.4e-12\n");
    let rows = load_capacitance_csv(f.path()).expect("load");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].frequency, 100.0);
    assert!((rows[2].capacitance - 2.4e-12).abs() < 1e-20);
}

#[test]
fn rejects_wrong_headers() {
    let f = write_csv("hz,farads\n100,3.1e-12\n1000,2.9e-12\n");
    let err = load_capacitance_csv(f.path()).expect_err("headers");
    assert!(err.to_string().contains("frequency,capacitance"));
}

#[test]
fn rejects_non_monotonic_frequencies() {
    let f = write_csv("frequency,capacitance\n1000,2.9e-12\n100,3.1e-12\n");
    let err = load_capacitance_csv(f.path()).expect_err("monotonic");
    assert!(err.to_string().contains("strictly increasing"));
}

#[test]
fn rejects_single_row_curves() {
    let f = write_csv("frequency,capacitance\n100,3.1e-12\n");
    let err = load_capacitance_csv(f.path()).expect_err("too short");
    assert!(err.to_string().contains("at least two rows"));
}

#[test]
fn rejects_malformed_rows() {
    let f = write_csv("frequency,capacitance\n100,3.1e-12\nnot-a-number,2e-12\n");
    let err = load_capacitance_csv(f.path()).expect_err("bad row");
    assert!(err.to_string().contains("invalid CSV row 3"));
}

#[test]
fn rejects_non_positive_values() {
    let f = write_csv("frequency,capacitance\n100,3.1e-12\n1000,0\n");
    assert!(load_capacitance_csv(f.path()).is_err());
}
