use crate::campaign::DialMode;

/// Calls to place for a campaign this tick.
///
/// `free_slots` is `max_concurrent` minus the campaign's non-terminal attempts, so the
/// result never pushes the campaign over its concurrency cap whatever the ratio.
///
/// ```
/// use rvoip_dialer_engine::campaign::DialMode;
/// use rvoip_dialer_engine::scheduler::compute_budget;
///
/// assert_eq!(compute_budget(DialMode::Power, 5, 2.0, 20), 10);
/// assert_eq!(compute_budget(DialMode::Progressive, 5, 2.0, 3), 3);
/// assert_eq!(compute_budget(DialMode::Preview, 5, 2.0, 20), 0);
/// ```
pub fn compute_budget(mode: DialMode, agents_available: u32, dial_ratio: f64, free_slots: u32) -> u32 {
    let wanted = match mode {
        DialMode::Preview => 0,
        DialMode::Progressive => agents_available,
        DialMode::Power | DialMode::Predictive => {
            let ratio = if dial_ratio.is_finite() { dial_ratio.max(0.0) } else { 1.0 };
            let calls = (f64::from(agents_available) * ratio).ceil();
            if calls >= f64::from(u32::MAX) {
                u32::MAX
            } else {
                calls as u32
            }
        }
    };
    wanted.min(free_slots)
}
