//! Cost-weighted distribution of blocks over ranks.

use crate::comm::RankContext;
use log::warn;

/// Rank assignment for the global block list: `ranklist[gid]` owns the block,
/// rank `r` owns the contiguous range starting at `nslist[r]` with
/// `nblist[r]` entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub ranklist: Vec<usize>,
    pub nslist: Vec<usize>,
    pub nblist: Vec<usize>,
}

/// Sweeps the cost list from the highest global index downward, filling ranks
/// from the last to the first and re-targeting the remaining average after
/// each rank closes. The coordinator rank therefore ends up with slightly
/// less than the mean load.
pub fn balance_load(costlist: &[f64], ctx: &RankContext, adaptive: bool) -> Partition {
    let nbtotal = costlist.len();
    let nranks = ctx.nranks;

    let mut totalcost = 0.0;
    let mut mincost = f64::MAX;
    let mut maxcost = 0.0f64;
    for &cost in costlist {
        totalcost += cost;
        mincost = mincost.min(cost);
        maxcost = maxcost.max(cost);
    }

    let mut ranklist = vec![0usize; nbtotal];
    let mut rank = nranks - 1;
    let mut target = totalcost / nranks as f64;
    let mut mycost = 0.0;
    for gid in (0..nbtotal).rev() {
        mycost += costlist[gid];
        ranklist[gid] = rank;
        if mycost >= target && rank > 0 {
            rank -= 1;
            totalcost -= mycost;
            mycost = 0.0;
            target = totalcost / (rank + 1) as f64;
        }
    }

    // Ranks left without blocks start past the end of the list.
    let mut nslist = vec![nbtotal; nranks];
    let mut nblist = vec![0usize; nranks];
    nslist[0] = 0;
    let mut r = 0;
    for gid in 1..nbtotal {
        if ranklist[gid] != ranklist[gid - 1] {
            nblist[r] = gid - nslist[r];
            r += 1;
            nslist[r] = gid;
        }
    }
    nblist[r] = nbtotal - nslist[r];

    if nbtotal % nranks != 0 && !adaptive && maxcost == mincost && ctx.is_coordinator() {
        warn!(
            "the number of blocks ({nbtotal}) cannot be divided evenly over {nranks} ranks; \
             this will cause a poor load balance"
        );
    }

    Partition {
        ranklist,
        nslist,
        nblist,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(nranks: usize) -> RankContext {
        RankContext { rank: 0, nranks }
    }

    #[test]
    fn uniform_costs_divide_evenly() {
        let part = balance_load(&[1.0; 16], &ctx(4), false);
        assert_eq!(part.nblist, [4, 4, 4, 4]);
        assert_eq!(part.nslist, [0, 4, 8, 12]);
        assert_eq!(part.nblist.iter().sum::<usize>(), 16);
    }

    #[test]
    fn coordinator_takes_the_remainder_shortfall() {
        // 10 blocks over 4 ranks: counts {2, 2, 3, 3} with rank 0 lightest.
        let part = balance_load(&[1.0; 10], &ctx(4), false);
        assert_eq!(part.nblist, [2, 2, 3, 3]);
        assert_eq!(part.nslist, [0, 2, 4, 7]);
        for (gid, &rank) in part.ranklist.iter().enumerate() {
            let start = part.nslist[rank];
            assert!(gid >= start && gid < start + part.nblist[rank]);
        }
    }

    #[test]
    fn weighted_costs_respect_contiguity() {
        let costs = [4.0, 1.0, 1.0, 1.0, 1.0, 4.0, 1.0, 1.0];
        let part = balance_load(&costs, &ctx(3), true);
        assert_eq!(part.nblist.iter().sum::<usize>(), costs.len());
        for r in 1..3 {
            assert_eq!(part.nslist[r], part.nslist[r - 1] + part.nblist[r - 1]);
        }
        // Rank 0 never exceeds the average load.
        let rank0: f64 = (0..part.nblist[0]).map(|g| costs[g]).sum();
        let avg = costs.iter().sum::<f64>() / 3.0;
        assert!(rank0 <= avg + 1e-12);
    }
}
