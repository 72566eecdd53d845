// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 MongoVC Contributors

use mongovc_engine::{BranchRecord, DocumentDiff, LogEntry, Status};

pub fn print_status(status: &Status) {
	if status.current_n < 0 {
		println!("on new branch `{}` (no version registered yet)", status.current_branch);
	} else {
		let detached = if status.detached { ", detached" } else { "" };
		println!("at version ({}, {}){detached}", status.current_n, status.current_branch);
	}
	println!("changed:   {}", if status.changed { "yes" } else { "no" });
	if status.has_stash {
		println!("stash:     present");
	}
	if status.has_conflicts {
		println!("conflicts: unresolved");
	}
}

pub fn print_log(entries: &[LogEntry], status: &Status) {
	for entry in entries {
		let marker = if entry.n == status.current_n && entry.branch == status.current_branch {
			"*"
		} else {
			" "
		};
		println!("{marker} ({}, {})  {}  {}", entry.n, entry.branch, entry.timestamp, entry.message);
	}
}

pub fn print_branches(records: &[BranchRecord], current: &str) {
	for record in records {
		let marker = if record.name == current { "*" } else { " " };
		println!("{marker} {}  tip ({}, {})", record.name, record.tip_n, record.tip_branch);
	}
}

pub fn print_diffs(diffs: &[DocumentDiff]) {
	if diffs.is_empty() {
		println!("no differences");
		return;
	}
	for diff in diffs {
		println!("document {}", diff.document_id);
		for (path, before, after) in diff.delta.changes() {
			match (before, after) {
				(None, Some(after)) => println!("  + {path}: {after}"),
				(Some(before), None) => println!("  - {path}: {before}"),
				(Some(before), Some(after)) => println!("  ~ {path}: {before} -> {after}"),
				(None, None) => {}
			}
		}
	}
}
