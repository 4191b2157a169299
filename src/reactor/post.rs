//! Posting reads from a CtC's `pending` FIFO while credit remains (spec
//! §4.4).

use crate::buffer_pool::BufferPool;
use crate::connection::CreditTrackedConnection;
use crate::error::{ErrorSink, ReaderError};
use crate::message::ConsumerMessage;
use crate::rdma::Verbs;

/// Posts RRs from `ctc.pending` until credit is exhausted or the queue is
/// empty (spec §4.4). Allocation failures destroy the RR and are reported as
/// `data_buffer_starvation` directly to its consumer set, since there is no
/// completion to carry the notice.
pub fn post_pending<V: Verbs, P: BufferPool>(
    ctc: &mut CreditTrackedConnection,
    verbs: &mut V,
    pool: &P,
    errors: &mut ErrorSink,
) {
    while ctc.has_credit() {
        let mut rr = match ctc.pending.pop_front() {
            Some(rr) => rr,
            None => break,
        };
        let bucket = pool.bucket_for(rr.buffer_size());
        let mut buffer = match pool.alloc(bucket) {
            Some(b) => b,
            None => {
                for consumer in &rr.consumers {
                    let _ = consumer.push(ConsumerMessage::DataBufferStarvation);
                }
                continue;
            }
        };
        let mr = match ctc.mr_for(bucket) {
            Some(mr) => mr,
            None => {
                errors.push(ReaderError::Setup(format!(
                    "no memory region registered for bucket {:?} on {}",
                    bucket, ctc.remote_addr
                )));
                ctc.pending.push_front(rr);
                break;
            }
        };
        let wr_id = ctc.next_wr_id();
        let remote_addr = rr.spectrum.data_addr;
        let rkey = match ctc.rkey {
            Some(rkey) => rkey,
            None => {
                errors.push(ReaderError::Setup(format!(
                    "posting read before established on {}",
                    ctc.remote_addr
                )));
                break;
            }
        };
        match verbs.post_read(ctc.cm_id, wr_id, remote_addr, rkey, mr, &mut buffer) {
            Ok(()) => {
                rr.buffer = Some(buffer);
                ctc.num_posted += 1;
                ctc.in_flight.insert(wr_id, rr);
            }
            Err(e) => {
                errors.push(ReaderError::Io(e));
                // Stop posting from this CtC for this tick; the RR is lost
                // along with its buffer (spec §4.4 step 4).
                break;
            }
        }
    }
}
