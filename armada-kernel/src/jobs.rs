/**
 * JOBS - Pool borné pour les travaux d'arrière-plan courts
 *
 * RÔLE : exécuter des callables divers (nettoyages, notifications,
 * vérifications ponctuelles) sans bloquer l'appelant. La soumission est
 * non bloquante, l'exécution asynchrone, et un callback optionnel reçoit
 * le résultat.
 *
 * Dimensionné par défaut au nombre de CPUs de la machine.
 */

use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum JobsError {
    #[error("job pool is not running")]
    NotRunning,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct JobPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    /// Pool dimensionné au nombre de CPUs.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_workers(workers)
    }

    pub fn with_workers(count: usize) -> Self {
        let count = count.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver: Arc<Mutex<Receiver<Job>>> = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::spawn(move || loop {
                // Le verrou ne couvre que le recv : un seul worker attend
                // la file à la fois, le job s'exécute hors verrou.
                let job = receiver.lock().recv();
                match job {
                    Ok(job) => job(),
                    Err(_) => {
                        debug!(worker = index, "job queue closed, worker exiting");
                        break;
                    }
                }
            });
            workers.push(handle);
        }

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn enqueue(&self, job: Job) -> Result<(), JobsError> {
        let sender = self.sender.as_ref().ok_or(JobsError::NotRunning)?;
        sender.send(job).map_err(|_| JobsError::NotRunning)
    }

    /// Soumet un callable, sans attendre son résultat.
    pub fn submit<F, T>(&self, func: F) -> Result<(), JobsError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(Box::new(move || {
            let _ = func();
        }))
    }

    /// Soumet un callable et invoque le callback avec son résultat.
    pub fn submit_with_callback<F, T, C>(&self, func: F, callback: C) -> Result<(), JobsError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        self.enqueue(Box::new(move || {
            let result = func();
            callback(result);
        }))
    }

    /// Ferme la file et attend la fin des workers.
    pub fn shutdown(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("job worker panicked before shutdown");
            }
        }
    }
}

impl Default for JobPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
