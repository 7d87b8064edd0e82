// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for parsing dev-server output and git plumbing output.
//!
//! Run with: `cargo bench --bench output_parsing`

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

use workbench::git::{parse_log, parse_ls_tree, parse_worktree_list};
use workbench::preview::patterns::{detect_port, detect_urls, is_error_line, strip_ansi};

/// A Vite-style startup banner mixed with ordinary build chatter.
fn dev_server_lines() -> Vec<String> {
    let mut lines = vec![
        "\u{1b}[32m\u{1b}[1mVITE\u{1b}[22m v5.2.0\u{1b}[39m  ready in 312 ms".to_string(),
        "  \u{1b}[32m➜\u{1b}[39m  \u{1b}[1mLocal\u{1b}[22m:   \u{1b}[36mhttp://localhost:4101/\u{1b}[39m"
            .to_string(),
        "  ➜  Network: use --host to expose".to_string(),
        "Error: Cannot find module './missing'".to_string(),
        "0 errors, 2 warnings".to_string(),
    ];
    for i in 0..95 {
        lines.push(format!("[vite] page reload src/components/Widget{}.tsx", i));
    }
    lines
}

fn bench_dev_server_output(c: &mut Criterion) {
    let lines = dev_server_lines();
    let mut group = c.benchmark_group("dev_server_output");
    group.throughput(Throughput::Elements(lines.len() as u64));

    group.bench_function("strip_ansi", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(strip_ansi(black_box(line)));
            }
        });
    });

    group.bench_function("detect_port", |b| {
        b.iter(|| lines.iter().find_map(|line| detect_port(black_box(line))));
    });

    group.bench_function("scan_line", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(detect_urls(line));
                black_box(is_error_line(line));
            }
        });
    });

    group.finish();
}

fn bench_git_output(c: &mut Criterion) {
    let ls_tree: String = (0..500)
        .map(|i| {
            format!(
                "100644 blob {:040x} {:>7}\tsrc/module_{}/file_{}.rs\0",
                i,
                i * 37,
                i / 20,
                i
            )
        })
        .collect();
    let log: String = (0..200)
        .map(|i| format!("{:040x}\t{}\tCommit number {}\n", i, 1_700_000_000 + i, i))
        .collect();
    let worktrees: String = (0..20)
        .map(|i| {
            format!(
                "worktree /ws/.execution/exec-{0}/mutate/app\nHEAD {0:040x}\nbranch refs/heads/exec-{0}\n\n",
                i
            )
        })
        .collect();

    let mut group = c.benchmark_group("git_output");
    group.bench_function("ls_tree_500", |b| b.iter(|| parse_ls_tree(black_box(&ls_tree))));
    group.bench_function("log_200", |b| b.iter(|| parse_log(black_box(&log))));
    group.bench_function("worktree_list_20", |b| {
        b.iter(|| parse_worktree_list(black_box(&worktrees)))
    });
    group.finish();
}

criterion_group!(benches, bench_dev_server_output, bench_git_output);
criterion_main!(benches);
