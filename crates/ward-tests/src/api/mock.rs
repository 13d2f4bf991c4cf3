//! Mock API implementation directly using the `ward-allocator` desk

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use ward_allocator::Desk;
use ward_core::{Reply, Request, RequestContext, RequestHandler, Responder};

use super::{Api, ApiResult, RequestMsg};

pub struct MockDesk {
    desk: Arc<Desk>,
    join_handles: Vec<JoinHandle<()>>,
}

struct MockResponder {
    response_channel: oneshot::Sender<ApiResult<Reply>>,
}

/// Serve `desk` from `threads` blocking worker tasks
pub fn start(threads: u16, desk: Desk) -> (MockDesk, Api) {
    let desk = Arc::new(desk);

    let it = (0..threads).map(|_| {
        let (sender, receiver) = flume::bounded::<RequestMsg>(65536);
        let desk = desk.clone();
        let handle = task::spawn_blocking(move || {
            let desk = &*desk;
            for msg in receiver.into_iter() {
                let responder = Box::new(MockResponder {
                    response_channel: msg.response_channel,
                });
                desk.handle(Request::new(msg.command, msg.context, responder))
            }
        });
        (sender, handle)
    });
    let (senders, join_handles) = it.unzip();

    let mock_desk = MockDesk { desk, join_handles };
    (mock_desk, Api::new(senders))
}

impl MockDesk {
    pub fn desk(&self) -> &Desk {
        &self.desk
    }

    pub async fn shutdown(self) {
        for handle in self.join_handles {
            handle.await.unwrap()
        }
        task::spawn_blocking(move || Arc::into_inner(self.desk).unwrap().shutdown())
            .await
            .unwrap();
    }
}

impl Responder for MockResponder {
    fn respond(self: Box<Self>, result: ApiResult<Reply>, _context: &RequestContext) {
        // the test may have stopped waiting
        let _ = self.response_channel.send(result);
    }
}
