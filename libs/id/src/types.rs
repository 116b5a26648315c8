//! Identifier types used across the node.

use crate::define_id;

define_id!(
    WorkerId,
    "wrk",
    "Identifies one room worker process. Minted by the scheduler before the process is launched."
);

define_id!(
    NodeId,
    "node",
    "Identifies one run of the scheduling node, for log correlation."
);
