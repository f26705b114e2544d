use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};
use crate::protocol::MsgContent;

type Predicate<E> = Box<dyn Fn(&E, &MsgContent) -> bool + Send + Sync>;
type Treatment<E> = Box<dyn Fn(&mut E, MsgContent) + Send + Sync>;

/// A named hook that can pull a message out of the normal dispatch path and
/// replay it later, once a condition on the owning entity holds. The sole
/// purpose is to make protocol races reproducible in tests.
///
/// Predicates and the treatment receive the entity under its exclusive lock;
/// a predicate that does not recognise the message's variant simply returns
/// `false`, which leaves the message on the normal path.
pub struct Interceptor<E> {
    name: String,
    delay_if: Predicate<E>,
    apply_when: Predicate<E>,
    treatment: Treatment<E>,
}

impl<E> Interceptor<E> {
    pub fn new(
        name: &str,
        delay_if: impl Fn(&E, &MsgContent) -> bool + Send + Sync + 'static,
        apply_when: impl Fn(&E, &MsgContent) -> bool + Send + Sync + 'static,
        treatment: impl Fn(&mut E, MsgContent) + Send + Sync + 'static,
    ) -> Result<Interceptor<E>> {
        if name.is_empty() {
            return Err(Error::Config(
                "interceptor name cannot be empty".to_string(),
            ));
        }
        Ok(Interceptor {
            name: name.to_string(),
            delay_if: Box::new(delay_if),
            apply_when: Box::new(apply_when),
            treatment: Box::new(treatment),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An entity (client or server) whose inbound messages can be intercepted.
/// The interceptor list is state of the entity itself, guarded by the same
/// lock as the rest of its fields.
pub trait Intercepted: Sized + Send + 'static {
    fn interceptors(&self) -> &[Arc<Interceptor<Self>>];
    fn interception_enabled(&self) -> bool;
    /// Signal fired after every state change of the entity; delayed-treatment
    /// workers park on it instead of polling.
    fn changed(&self) -> &Arc<Notify>;
}

/// Runs the registered interceptors over a message about to be dispatched.
/// The first interceptor whose delay predicate accepts the message captures
/// it and hands it to a background worker; `None` tells the caller to skip
/// normal dispatch. `guard` is the locked entity behind `entity`.
pub fn intercept<E: Intercepted>(
    entity: &Arc<Mutex<E>>,
    guard: &E,
    msg: MsgContent,
) -> Option<MsgContent> {
    if !guard.interception_enabled() {
        return Some(msg);
    }
    for interceptor in guard.interceptors() {
        if (interceptor.delay_if)(guard, &msg) {
            info!("interceptor {} intercepts message: {:?}", interceptor.name, msg);
            spawn_delayed(entity.clone(), interceptor.clone(), msg);
            return None;
        }
    }
    Some(msg)
}

/// The delayed-treatment worker: wakes up on every state change of the
/// entity, re-evaluates the apply predicate under the entity lock, and runs
/// the treatment exactly once when the predicate holds.
fn spawn_delayed<E: Intercepted>(
    entity: Arc<Mutex<E>>,
    interceptor: Arc<Interceptor<E>>,
    msg: MsgContent,
) {
    tokio::spawn(async move {
        let notify = { entity.lock().await.changed().clone() };
        let mut msg = Some(msg);
        loop {
            //register interest before checking, so a change racing with the
            //check still wakes the worker up
            let notified = notify.notified();
            {
                let mut guard = entity.lock().await;
                let content = match msg.take() {
                    Some(content) => content,
                    None => return,
                };
                if (interceptor.apply_when)(&guard, &content) {
                    debug!(
                        "interceptor {} applies delayed treatment: {:?}",
                        interceptor.name, content
                    );
                    (interceptor.treatment)(&mut guard, content);
                    guard.changed().notify_waiters();
                    return;
                }
                msg = Some(content);
            }
            notified.await;
        }
    });
}
