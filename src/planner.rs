use std::collections::BTreeMap;

/// One planned fill: bind `count` projects to `billing_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub billing_name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    /// Fills in execution order, concentrated onto the most-used accounts.
    pub assignments: Vec<Assignment>,
    /// Unbound projects no open billing account had room for; the caller
    /// leaves them unchanged and retries next cycle.
    pub deferred: Vec<String>,
}

impl AllocationPlan {
    pub fn planned(&self) -> usize {
        self.assignments.iter().map(|a| a.count).sum()
    }
}

/// Decide where unbound projects go.
///
/// Concentration policy: fill the billing account that already carries the
/// most projects first, up to `cap` projects each, before touching a less
/// used one. Ties on `(usage, slots)` break by billing name so plans are
/// deterministic.
pub fn plan_allocations(
    unbound: &[String],
    open_billings: &[String],
    usage: &BTreeMap<String, usize>,
    cap: usize,
) -> AllocationPlan {
    let mut candidates: Vec<(&str, usize, usize)> = open_billings
        .iter()
        .map(|name| {
            let used = usage.get(name).copied().unwrap_or(0);
            (name.as_str(), used, cap.saturating_sub(used))
        })
        .filter(|(_, _, slots)| *slots > 0)
        .collect();
    candidates.sort_by(|a, b| {
        b.1.cmp(&a.1) // usage desc
            .then(b.2.cmp(&a.2)) // slots desc
            .then(a.0.cmp(b.0)) // name asc
    });

    let mut remaining = unbound.len();
    let mut assignments = Vec::new();
    for (name, _, slots) in candidates {
        if remaining == 0 {
            break;
        }
        let take = slots.min(remaining);
        assignments.push(Assignment {
            billing_name: name.to_string(),
            count: take,
        });
        remaining -= take;
    }

    AllocationPlan {
        assignments,
        deferred: unbound[unbound.len() - remaining..].to_vec(),
    }
}
