use crate::error::{Error, Result};
use crate::types::{parse_testing_hostnames, CommitHash, Ref, Target, TargetKind};

/// Ancestry facts the selector needs but cannot compute itself (it is pure
/// and has no repository access). Callers pass a concrete implementation
/// backed by the VCS gateway; tests pass a hand-built fixture.
pub trait AncestryOracle {
	/// `merge_base(a, b) == merge_base(b, a)`; fails with an error if the
	/// two histories share no common ancestor.
	fn merge_base(&self, a: &CommitHash, b: &CommitHash) -> Result<CommitHash>;

	fn is_ancestor(&self, a: &CommitHash, b: &CommitHash) -> Result<bool>;
}

/// Component E. Pure function: given the remote refs and the currently
/// deployed commit, picks the target commit and its type.
///
/// Mirrors spec §4.E exactly:
/// 1. partition refs into main / testing candidates / other
/// 2. reject candidates that are landed (merged into main) or that would
///    downgrade the host below the base of its current trajectory
/// 3. pick the surviving candidate with the latest committer timestamp,
///    tie-broken lexicographically by branch name
/// 4. fall back to main if no candidate survives
pub fn select_target(
	this_hostname: &str,
	main_name: &str,
	testing_prefix: &str,
	testing_separator: &str,
	refs: &[Ref],
	deployed_commit: Option<&CommitHash>,
	oracle: &dyn AncestryOracle,
) -> Result<Target> {
	let main = refs
		.iter()
		.find(|r| r.name == main_name)
		.ok_or_else(|| Error::fatal(format!("main branch {main_name} not found on remote")))?;

	// Base of the currently deployed trajectory, computed once: the point
	// at which the host's current history and main diverge. Testing
	// candidates strictly behind this point would downgrade the host.
	let base = match deployed_commit {
		Some(deployed) => Some(oracle.merge_base(deployed, &main.tip)?),
		None => None,
	};

	let mut candidates: Vec<&Ref> = Vec::new();
	for r in refs {
		if r.name == main_name {
			continue;
		}
		let Some(hosts) = parse_testing_hostnames(&r.name, testing_prefix, testing_separator) else {
			continue;
		};
		if !hosts.contains(&this_hostname) {
			continue;
		}
		if oracle.is_ancestor(&r.tip, &main.tip)? {
			// Landed: the branch's changes are already on main.
			continue;
		}
		if let Some(base) = &base {
			if r.tip != *base && oracle.is_ancestor(&r.tip, base)? {
				// Strictly behind the base of the current trajectory: would
				// be a downgrade relative to what's already deployed.
				continue;
			}
		}
		candidates.push(r);
	}

	if candidates.is_empty() {
		return Ok(Target {
			commit: main.tip.clone(),
			kind: TargetKind::Main,
			ref_name: main.name.clone(),
		});
	}

	candidates.sort_by(|a, b| {
		b.committer_timestamp
			.cmp(&a.committer_timestamp)
			.then_with(|| a.name.cmp(&b.name))
	});
	let winner = candidates[0];
	Ok(Target {
		commit: winner.tip.clone(),
		kind: TargetKind::Testing,
		ref_name: winner.name.clone(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	/// A fixture ancestry oracle over a hand-built commit DAG, expressed as
	/// `child -> parents`. Good enough to model the linear + occasional
	/// branch histories the selector's invariants are stated over.
	struct FixtureDag {
		parents: HashMap<&'static str, Vec<&'static str>>,
	}

	impl FixtureDag {
		fn new(parents: &[(&'static str, &[&'static str])]) -> Self {
			Self {
				parents: parents.iter().map(|(k, v)| (*k, v.to_vec())).collect(),
			}
		}

		fn ancestors(&self, start: &str) -> std::collections::HashSet<String> {
			let mut seen = std::collections::HashSet::new();
			let mut stack = vec![start.to_string()];
			while let Some(node) = stack.pop() {
				if !seen.insert(node.clone()) {
					continue;
				}
				if let Some(parents) = self.parents.get(node.as_str()) {
					stack.extend(parents.iter().map(|p| p.to_string()));
				}
			}
			seen
		}
	}

	impl AncestryOracle for FixtureDag {
		fn merge_base(&self, a: &CommitHash, b: &CommitHash) -> Result<CommitHash> {
			let a_anc = self.ancestors(&a.0);
			let b_anc = self.ancestors(&b.0);
			// Among commits in both ancestor sets, our fixture DAGs are
			// built so there's a unique "best" one: the one that is itself
			// an ancestor of every other shared ancestor. For the small
			// hand-built graphs in these tests a direct membership test on
			// the documented merge-base commit is sufficient.
			let mut shared: Vec<&String> = a_anc.intersection(&b_anc).collect();
			if shared.is_empty() {
				return Err(Error::fatal("no common ancestor"));
			}
			// Pick the shared ancestor with the most ancestors itself (the
			// most "recent" one), breaking ties deterministically.
			shared.sort();
			let best = shared
				.into_iter()
				.max_by_key(|c| self.ancestors(c).len())
				.unwrap();
			Ok(CommitHash(best.clone()))
		}

		fn is_ancestor(&self, a: &CommitHash, b: &CommitHash) -> Result<bool> {
			Ok(self.ancestors(&b.0).contains(&a.0))
		}
	}

	fn r(name: &str, tip: &str, ts: i64) -> Ref {
		Ref {
			name: name.to_string(),
			tip: tip.into(),
			committer_timestamp: ts,
		}
	}

	// S1: up to date — main only, nothing else to pick.
	#[test]
	fn s1_main_only() {
		let dag = FixtureDag::new(&[("M1", &[])]);
		let refs = vec![r("main", "M1", 10)];
		let target = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M1".into()), &dag,
		)
		.unwrap();
		assert_eq!(target.commit, "M1".into());
		assert_eq!(target.kind, TargetKind::Main);
	}

	// S2: a testing branch for this host, ahead of main and not merged.
	#[test]
	fn s2_testing_branch_selected() {
		let dag = FixtureDag::new(&[("M1", &[]), ("M2", &["M1"]), ("T1", &["M1"])]);
		let refs = vec![r("main", "M2", 10), r("testing/alpha", "T1", 20)];
		let target = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M1".into()), &dag,
		)
		.unwrap();
		assert_eq!(target.commit, "T1".into());
		assert_eq!(target.kind, TargetKind::Testing);
	}

	// S3: two valid candidates (hostname order permuted in branch name);
	// later committer timestamp wins.
	#[test]
	fn s3_latest_timestamp_wins_regardless_of_hostname_order() {
		let dag = FixtureDag::new(&[
			("M2", &[]),
			("M3", &["M2"]),
			("T2", &["M2"]),
			("T3", &["M2"]),
		]);
		let refs = vec![
			r("main", "M3", 10),
			r("testing/alpha/beta", "T2", 20),
			r("testing/beta/alpha", "T3", 30),
		];
		let target = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M2".into()), &dag,
		)
		.unwrap();
		assert_eq!(target.commit, "T3".into());
		assert_eq!(target.kind, TargetKind::Testing);
	}

	// S4: landed-branch bypass — testing tip already merged into main.
	#[test]
	fn s4_landed_branch_is_bypassed() {
		let dag = FixtureDag::new(&[("M3", &[]), ("T4", &["M3"]), ("M4", &["T4"])]);
		let refs = vec![r("main", "M4", 10), r("testing/alpha", "T4", 20)];
		let target = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M3".into()), &dag,
		)
		.unwrap();
		assert_eq!(target.commit, "M4".into());
		assert_eq!(target.kind, TargetKind::Main);
	}

	// S5: downgrade prevention — candidate strictly behind
	// merge_base(deployed, main) = M3, on the same line as the deployed
	// trajectory. A branch this old is necessarily also already reachable
	// from main, so this fixture trips the landed-branch bypass on its way
	// to the rejection too; under real ancestor-reachability semantics the
	// two checks can't be isolated from each other here.
	#[test]
	fn s5_downgrade_via_testing_is_prevented() {
		let dag = FixtureDag::new(&[
			("R0", &[]),
			("T5", &["R0"]),
			("M3", &["T5"]),
			("M5", &["M3"]),
		]);
		let refs = vec![r("main", "M5", 10), r("testing/alpha", "T5", 20)];
		let target = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M3".into()), &dag,
		)
		.unwrap();
		assert_eq!(target.commit, "M5".into());
		assert_eq!(target.kind, TargetKind::Main);
	}

	// Invariant: no deployed commit known (first-ever run) disables the
	// downgrade check, per the documented open-question resolution.
	#[test]
	fn unknown_deployed_commit_disables_downgrade_check() {
		let dag = FixtureDag::new(&[("M1", &[]), ("M5", &["M1"]), ("T5", &["M1"])]);
		let refs = vec![r("main", "M5", 10), r("testing/alpha", "T5", 5)];
		let target = select_target("alpha", "main", "testing/", "/", &refs, None, &dag).unwrap();
		assert_eq!(target.commit, "T5".into());
		assert_eq!(target.kind, TargetKind::Testing);
	}

	// Invariant 3: hostname-set match is order-insensitive (exercised above
	// in s3 too; this isolates it against a two-host branch with a lone
	// candidate).
	#[test]
	fn hostname_order_does_not_affect_selection() {
		let dag = FixtureDag::new(&[("M1", &[]), ("T1", &["M1"])]);
		let refs_a = vec![r("main", "M1", 1), r("testing/alpha/beta", "T1", 5)];
		let refs_b = vec![r("main", "M1", 1), r("testing/beta/alpha", "T1", 5)];
		let target_a =
			select_target("alpha", "main", "testing/", "/", &refs_a, None, &dag).unwrap();
		let target_b =
			select_target("alpha", "main", "testing/", "/", &refs_b, None, &dag).unwrap();
		assert_eq!(target_a.commit, target_b.commit);
		assert_eq!(target_a.kind, target_b.kind);
	}

	// Invariant 4: determinism for identical inputs.
	#[test]
	fn selection_is_deterministic() {
		let dag = FixtureDag::new(&[("M1", &[]), ("M2", &["M1"]), ("T1", &["M1"])]);
		let refs = vec![r("main", "M2", 10), r("testing/alpha", "T1", 20)];
		let first = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M1".into()), &dag,
		)
		.unwrap();
		let second = select_target(
			"alpha", "main", "testing/", "/", &refs, Some(&"M1".into()), &dag,
		)
		.unwrap();
		assert_eq!(first, second);
	}

	// Tie-break: identical committer timestamps fall back to lexicographic
	// branch-name order.
	#[test]
	fn timestamp_tie_breaks_lexicographically() {
		let dag = FixtureDag::new(&[("M1", &[]), ("Ta", &["M1"]), ("Tb", &["M1"])]);
		let refs = vec![
			r("main", "M1", 1),
			r("testing/alpha/zzz", "Ta", 50),
			r("testing/alpha/aaa", "Tb", 50),
		];
		let target = select_target("alpha", "main", "testing/", "/", &refs, None, &dag).unwrap();
		// "testing/alpha/aaa" < "testing/alpha/zzz" lexicographically.
		assert_eq!(target.ref_name, "testing/alpha/aaa");
	}

	// Candidates not mentioning this host, or not matching the testing
	// prefix at all, are ignored (the `other` bucket).
	#[test]
	fn unrelated_refs_are_ignored() {
		let dag = FixtureDag::new(&[("M1", &[]), ("T1", &["M1"])]);
		let refs = vec![
			r("main", "M1", 1),
			r("testing/someone-else", "T1", 100),
			r("feature/unrelated", "T1", 200),
		];
		let target = select_target("alpha", "main", "testing/", "/", &refs, None, &dag).unwrap();
		assert_eq!(target.kind, TargetKind::Main);
	}

	#[test]
	fn missing_main_branch_is_an_error() {
		let dag = FixtureDag::new(&[("M1", &[])]);
		let refs = vec![r("develop", "M1", 1)];
		assert!(select_target("alpha", "main", "testing/", "/", &refs, None, &dag).is_err());
	}
}
