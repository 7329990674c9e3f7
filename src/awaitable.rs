//! What the runtime can suspend on, and what it may assume about the result.
//!
//! Any [`Future`] is a primitive waitable: a single `poll` either reports the
//! value as ready or stores the waiting party's [`Waker`](std::task::Waker)
//! and reports `Pending`, leaving the driver free to run other work. Anything
//! implementing [`IntoFuture`] is a convertible awaitable; its result type is
//! resolved through the conversion down to the primitive future.
//!
//! The value a waitable yields is classified by [`Outcome`]: either a plain
//! `()` that cannot fail, or a `Result` whose error is re-raised at the point
//! where the value is consumed.

/// The resolved value of an awaitable, split into success and failure.
///
/// # Example
/// ```
/// use lockstep::awaitable::Outcome;
///
/// let ok: Result<u8, std::io::Error> = Ok(3);
/// assert_eq!(ok.into_result().unwrap(), 3);
/// assert!(().into_result().is_ok());
/// ```
pub trait Outcome {
    /// The value produced on success.
    type Value;

    /// Converts into the runtime's uniform result, re-raising captured errors.
    fn into_result(self) -> anyhow::Result<Self::Value>;
}

impl Outcome for () {
    type Value = ();

    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T, E> Outcome for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    type Value = T;

    fn into_result(self) -> anyhow::Result<T> {
        self.map_err(Into::into)
    }
}

/// Success value produced by awaiting `A`.
pub type ValueOf<A> = <<A as IntoFuture>::Output as Outcome>::Value;
