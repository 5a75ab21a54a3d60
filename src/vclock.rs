//! Vector clocks for causal ordering between tree replicas.
//!
//! Column 0 is always the owning tree's `local_vclock`; columns 1.. are the
//! `remote_vclock` entries in the tree's peer-tree insertion order.

use crate::error::VClockError;

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
	Less,
	Equal,
	Greater,
	Concurrent,
}

/// `a ≤ b` iff `∀i a[i] ≤ b[i]`; `a < b` iff `a ≤ b ∧ a ≠ b`; otherwise
/// concurrent. Clocks of different lengths are zero-extended on the shorter
/// side before comparing, since a missing column is an implicit zero count.
pub fn compare(a: &[i32], b: &[i32]) -> Ordering {
	let len = a.len().max(b.len());
	let mut le = true;
	let mut ge = true;
	for i in 0..len {
		let av = a.get(i).copied().unwrap_or(0);
		let bv = b.get(i).copied().unwrap_or(0);
		if av > bv {
			le = false;
		}
		if av < bv {
			ge = false;
		}
	}
	match (le, ge) {
		(true, true) => Ordering::Equal,
		(true, false) => Ordering::Less,
		(false, true) => Ordering::Greater,
		(false, false) => Ordering::Concurrent,
	}
}

/// Component-wise max. Shorter clock is zero-extended to the longer length.
pub fn merge(a: &[i32], b: &[i32]) -> Vec<i32> {
	let len = a.len().max(b.len());
	(0..len)
		.map(|i| {
			let av = a.get(i).copied().unwrap_or(0);
			let bv = b.get(i).copied().unwrap_or(0);
			av.max(bv)
		})
		.collect()
}

/// Translate `remote_clock` (indexed by `remote_columns`, a list of peer-tree
/// uuids in the remote's column order) into the local column space defined
/// by `local_columns`. Remote columns with no local counterpart are appended
/// to the local column set in the order encountered; the caller is expected
/// to create placeholder VCLOCK trees for each uuid returned in
/// `RemapResult::new_columns`.
pub struct RemapResult {
	pub local_clock: Vec<i32>,
	/// Peer-tree uuids that had no local column and were appended, in the
	/// order they now occupy at the tail of `local_clock`.
	pub new_columns: Vec<uuid::Uuid>,
}

pub fn remap(
	remote_clock: &[i32],
	remote_columns: &[uuid::Uuid],
	local_columns: &[uuid::Uuid],
) -> Result<RemapResult, VClockError> {
	if remote_clock.len() != remote_columns.len() {
		return Err(VClockError::IncompatibleLengths {
			a: remote_clock.len(),
			b: remote_columns.len(),
		});
	}

	let mut local_clock = vec![0i32; local_columns.len()];
	let mut new_columns = Vec::new();
	let mut extended_columns: Vec<uuid::Uuid> = local_columns.to_vec();

	for (value, uuid) in remote_clock.iter().zip(remote_columns.iter()) {
		if let Some(idx) = extended_columns.iter().position(|c| c == uuid) {
			local_clock[idx] = *value;
		} else {
			extended_columns.push(*uuid);
			local_clock.push(*value);
			new_columns.push(*uuid);
		}
	}

	Ok(RemapResult { local_clock, new_columns })
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::Uuid;

	#[test]
	fn compare_is_reflexive() {
		assert_eq!(compare(&[1, 2, 3], &[1, 2, 3]), Ordering::Equal);
	}

	#[test]
	fn compare_less_and_greater_are_symmetric() {
		assert_eq!(compare(&[1, 2], &[1, 3]), Ordering::Less);
		assert_eq!(compare(&[1, 3], &[1, 2]), Ordering::Greater);
	}

	#[test]
	fn compare_detects_concurrent() {
		assert_eq!(compare(&[1, 0], &[0, 1]), Ordering::Concurrent);
	}

	#[test]
	fn compare_zero_extends_shorter_clock() {
		assert_eq!(compare(&[0, 0], &[0]), Ordering::Equal);
		assert_eq!(compare(&[1, 0], &[1]), Ordering::Equal);
		assert_eq!(compare(&[0, 1], &[0]), Ordering::Greater);
	}

	#[test]
	fn compare_partitions_all_pairs() {
		let pairs: Vec<(Vec<i32>, Vec<i32>)> = vec![
			(vec![0, 0], vec![0, 0]),
			(vec![1, 0], vec![0, 0]),
			(vec![0, 0], vec![1, 0]),
			(vec![1, 0], vec![0, 1]),
		];
		for (a, b) in pairs {
			let result = compare(&a, &b);
			// exactly one of the four outcomes, and compare(b,a) is the mirror
			let mirrored = compare(&b, &a);
			match result {
				Ordering::Equal => assert_eq!(mirrored, Ordering::Equal),
				Ordering::Less => assert_eq!(mirrored, Ordering::Greater),
				Ordering::Greater => assert_eq!(mirrored, Ordering::Less),
				Ordering::Concurrent => assert_eq!(mirrored, Ordering::Concurrent),
			}
		}
	}

	#[test]
	fn merge_is_commutative() {
		let a = vec![1, 5, 2];
		let b = vec![3, 2, 7];
		assert_eq!(merge(&a, &b), merge(&b, &a));
	}

	#[test]
	fn merge_is_associative() {
		let a = vec![1, 0, 3];
		let b = vec![0, 5, 0];
		let c = vec![2, 2, 2];
		assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
	}

	#[test]
	fn merge_is_idempotent() {
		let a = vec![4, 1, 9];
		assert_eq!(merge(&a, &a), a);
	}

	#[test]
	fn compare_merge_is_greater_or_equal_to_either_input() {
		let a = vec![1, 0];
		let b = vec![0, 1];
		let m = merge(&a, &b);
		assert!(matches!(compare(&m, &a), Ordering::Greater | Ordering::Equal));
		assert!(matches!(compare(&m, &b), Ordering::Greater | Ordering::Equal));
	}

	#[test]
	fn remap_reuses_known_columns() {
		let t0 = Uuid::from_u128(0);
		let t1 = Uuid::from_u128(1);
		let local_columns = vec![t0, t1];
		let remote_columns = vec![t1, t0];
		let remote_clock = vec![5, 3];
		let result = remap(&remote_clock, &remote_columns, &local_columns).unwrap();
		assert_eq!(result.local_clock, vec![3, 5]);
		assert!(result.new_columns.is_empty());
	}

	#[test]
	fn remap_appends_unknown_columns_as_placeholders() {
		let t0 = Uuid::from_u128(0);
		let unknown = Uuid::from_u128(99);
		let local_columns = vec![t0];
		let remote_columns = vec![t0, unknown];
		let remote_clock = vec![2, 7];
		let result = remap(&remote_clock, &remote_columns, &local_columns).unwrap();
		assert_eq!(result.local_clock, vec![2, 7]);
		assert_eq!(result.new_columns, vec![unknown]);
	}

	#[test]
	fn remap_preserves_comparison_under_common_superset() {
		let t0 = Uuid::from_u128(0);
		let t1 = Uuid::from_u128(1);
		let t2 = Uuid::from_u128(2);

		// a knows only t0,t1; b knows t0,t1,t2 - remap both into [t0,t1,t2]
		let a_columns = vec![t0, t1];
		let a_clock = vec![3, 1];
		let b_columns = vec![t0, t1, t2];
		let b_clock = vec![1, 1, 4];

		let superset = vec![t0, t1, t2];
		let a_mapped = remap(&a_clock, &a_columns, &superset).unwrap().local_clock;
		let b_mapped = remap(&b_clock, &b_columns, &superset).unwrap().local_clock;

		assert_eq!(compare(&a_clock, &b_clock[..2]), compare(&a_mapped, &b_mapped));
	}

	#[test]
	fn remap_rejects_mismatched_lengths() {
		let t0 = Uuid::from_u128(0);
		let result = remap(&[1, 2], &[t0], &[t0]);
		assert!(result.is_err());
	}
}

// vim: ts=4
