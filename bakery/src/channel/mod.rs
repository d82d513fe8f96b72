//! Typed System-V message queues.
//!
//! Every message carries a positive type tag used as the routing key: the
//! receiver asks for one tag (or 0 for "any") and the kernel hands back the
//! oldest matching message, so per-tag delivery order is send order.

use std::io;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::thread;
use std::time::Duration;

use crate::core::{ShmemCast, Shutdown};
use crate::errors::{BakeryError, Result};

const RECV_POLL: Duration = Duration::from_millis(5);

#[repr(C)]
struct Envelope<M: ShmemCast> {
    mtype: libc::c_long,
    body: M,
}

pub struct MessageQueue<M: ShmemCast> {
    id: libc::c_int,
    _marker: PhantomData<M>,
}

impl<M: ShmemCast> Clone for MessageQueue<M> {
    fn clone(&self) -> Self {
        MessageQueue { id: self.id, _marker: PhantomData }
    }
}

impl<M: ShmemCast> std::fmt::Debug for MessageQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue").field("id", &self.id).finish()
    }
}

impl<M: ShmemCast> MessageQueue<M> {
    /// A new private queue. Children learn its id at spawn time.
    pub fn create() -> Result<MessageQueue<M>> {
        let id = unsafe { libc::msgget(libc::IPC_PRIVATE, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(BakeryError::last_os("msgget"));
        }
        Ok(MessageQueue { id, _marker: PhantomData })
    }

    pub fn from_id(id: i32) -> MessageQueue<M> {
        MessageQueue { id, _marker: PhantomData }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn send(&self, mtype: i64, message: &M) -> Result<()> {
        if mtype <= 0 {
            return Err(BakeryError::Logic(format!("message type must be positive, got {}", mtype)));
        }
        let envelope = Envelope { mtype: mtype as libc::c_long, body: *message };
        loop {
            let rc = unsafe {
                libc::msgsnd(
                    self.id,
                    &envelope as *const Envelope<M> as *const libc::c_void,
                    mem::size_of::<M>(),
                    0,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(BakeryError::Os { call: "msgsnd", source: err });
            }
        }
    }

    fn receive(&self, mtype: i64, flags: libc::c_int) -> std::result::Result<M, io::Error> {
        let mut envelope = MaybeUninit::<Envelope<M>>::uninit();
        let n = unsafe {
            libc::msgrcv(
                self.id,
                envelope.as_mut_ptr() as *mut libc::c_void,
                mem::size_of::<M>(),
                mtype as libc::c_long,
                flags,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != mem::size_of::<M>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short message: {} of {} bytes", n, mem::size_of::<M>()),
            ));
        }
        let envelope = unsafe { envelope.assume_init() };
        Ok(envelope.body)
    }

    /// Waits until a message tagged `mtype` arrives. There is no timeout;
    /// only a raised `shutdown` flag ends it early, with
    /// `BakeryError::Cancelled`. The wait polls so the flag is seen even when
    /// the signal that raised it was delivered to another thread.
    pub fn recv(&self, mtype: i64, shutdown: &Shutdown) -> Result<M> {
        loop {
            shutdown.ensure_not_closing()?;
            match self.try_recv(mtype)? {
                Some(m) => return Ok(m),
                None => thread::sleep(RECV_POLL),
            }
        }
    }

    pub fn try_recv(&self, mtype: i64) -> Result<Option<M>> {
        loop {
            match self.receive(mtype, libc::IPC_NOWAIT) {
                Ok(m) => return Ok(Some(m)),
                Err(e) if e.raw_os_error() == Some(libc::ENOMSG) => return Ok(None),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(BakeryError::Os { call: "msgrcv", source: e }),
            }
        }
    }

    pub fn remove(&self) -> Result<()> {
        if unsafe { libc::msgctl(self.id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
            let err = io::Error::last_os_error();
            // Already gone.
            if err.raw_os_error() != Some(libc::EINVAL) && err.raw_os_error() != Some(libc::EIDRM) {
                return Err(BakeryError::Os { call: "msgctl", source: err });
            }
        }
        Ok(())
    }
}
