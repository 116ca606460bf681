use salvo::prelude::*;

use crate::web::metrics::format_prometheus;
use crate::web::web_state;

#[handler]
pub async fn metrics(res: &mut Response) {
    let state = web_state();
    let uptime_seconds = state.started_at.elapsed().as_secs();
    let subscription = state
        .subscription
        .read()
        .as_ref()
        .map(|handle| handle.status());

    res.render(Text::Plain(format_prometheus(
        uptime_seconds,
        subscription.as_ref(),
    )));
}
