/// Execute an aggregate command deterministically (no IO, no async).
///
/// Decides with `handle` then evolves the aggregate with `apply`, returning the
/// emitted events. Infra uses the two halves separately when a commit has to be
/// coordinated with other state (for example the inventory ledger); this helper
/// covers the simple case and tests.
pub fn execute<A>(
    aggregate: &mut A,
    command: &A::Command,
) -> Result<Vec<A::Event>, A::Error>
where
    A: rentflow_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
