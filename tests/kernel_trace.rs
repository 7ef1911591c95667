//! Traces real commands through the BPF backend. Needs root and a kernel
//! with BTF, so these are ignored by default:
//!
//! sudo -E cargo test --features bpf --test kernel_trace -- --ignored

#![cfg(feature = "bpf")]

use std::fs;

use tmt::output::LIVENESS_FILE;
use tmt::{run, Config};

fn root_config(command: &str, dir: &std::path::Path) -> Config {
    Config {
        command: Some(command.to_string()),
        output_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

fn liveness(dir: &std::path::Path) -> Vec<(u64, usize)> {
    fs::read_to_string(dir.join(LIVENESS_FILE))
        .unwrap()
        .lines()
        .skip(1)
        .map(|line| {
            let (time, alive) = line.split_once(',').unwrap();
            (time.parse().unwrap(), alive.parse().unwrap())
        })
        .collect()
}

#[test]
#[ignore]
fn test_fork_chain_is_traced() {
    let dir = tempfile::tempdir().unwrap();
    let config = root_config("sh -c 'true' & sh -c 'true' & wait; exit 4", dir.path());

    assert_eq!(run(&config).unwrap(), 4);

    let samples = liveness(dir.path());
    assert!(!samples.is_empty());
    assert!(samples.iter().map(|(_, alive)| *alive).max().unwrap() >= 2);
    assert!(samples.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(samples.last().unwrap().1, 0);
}

#[test]
#[ignore]
fn test_busy_command_has_slices() {
    let dir = tempfile::tempdir().unwrap();
    let config = root_config(
        "i=0; while [ $i -lt 20000 ]; do i=$((i+1)); done",
        dir.path(),
    );

    assert_eq!(run(&config).unwrap(), 0);

    let slices = fs::read_to_string(dir.path().join(tmt::output::SLICES_FILE)).unwrap();
    assert!(slices.lines().count() > 1);
    let ranking = fs::read_to_string(dir.path().join(tmt::output::RANKING_FILE)).unwrap();
    assert!(ranking.lines().skip(1).any(|line| line.contains("sh:")));
}
