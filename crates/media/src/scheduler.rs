//! Adaptiver RTP-Scheduler
//!
//! Taktet ausgehende Frames so, dass die Gegenseite einen gleichmaessigen
//! Strom sieht, auch wenn Timer ungenau feuern oder der Sende-Callback
//! einmal blockiert.
//!
//! ## Virtuelle Puffertiefe
//!
//! ```text
//! tiefe = gesendetes Audio (ms) - vergangene Echtzeit (ms)
//!
//! tiefe <  ziel  -> sofort senden ("natuerlicher Burst")
//! tiefe >= ziel  -> (tiefe - ziel) warten, dann senden
//! tiefe <  0     -> Underrun: Basis auf jetzt zuruecksetzen, per Burst aufholen
//! ```
//!
//! Die Tiefe wird vor jedem Senden gemessen. Ein blockierender Callback
//! verschiebt also nie den Zeitplan: der naechste Aufruf kommt so frueh wie
//! moeglich, und nach einem Underrun wird nicht Zeit gestaucht, sondern die
//! Basis neu gesetzt.
//!
//! Die Frame-Dauer darf sich zur Laufzeit aendern (Opus mit 40-ms-Frames);
//! sie wird nach jedem Frame neu gelesen.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Konfiguration und Statistik
// ---------------------------------------------------------------------------

/// Konfiguration eines Schedulers
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Angestrebte virtuelle Puffertiefe (0 = fester Takt)
    pub ziel_tiefe_ms: u32,
    /// Audiodauer pro Frame
    pub frame_dauer_ms: u32,
}

impl SchedulerConfig {
    /// Fester Takt ohne Vorlauf (fuer Priming)
    pub fn takt(frame_dauer_ms: u32) -> Self {
        Self {
            ziel_tiefe_ms: 0,
            frame_dauer_ms,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ziel_tiefe_ms: 60,
            frame_dauer_ms: 20,
        }
    }
}

/// Statistiken eines Schedulers (Snapshot)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStatistik {
    /// Anzahl Callback-Aufrufe
    pub pakete_geplant: u64,
    /// Anzahl Basis-Ruecksetzungen wegen negativer Tiefe
    pub underruns: u64,
    /// Anzahl Sendungen ohne Wartezeit
    pub natuerliche_bursts: u64,
    pub min_tiefe_ms: f64,
    pub max_tiefe_ms: f64,
    pub mittlere_tiefe_ms: f64,
    tiefe_summe_ms: f64,
}

impl SchedulerStatistik {
    fn tiefe_erfassen(&mut self, tiefe_ms: f64) {
        if self.pakete_geplant == 0 {
            self.min_tiefe_ms = tiefe_ms;
            self.max_tiefe_ms = tiefe_ms;
        } else {
            self.min_tiefe_ms = self.min_tiefe_ms.min(tiefe_ms);
            self.max_tiefe_ms = self.max_tiefe_ms.max(tiefe_ms);
        }
        self.tiefe_summe_ms += tiefe_ms;
        self.mittlere_tiefe_ms = self.tiefe_summe_ms / (self.pakete_geplant + 1) as f64;
    }
}

// ---------------------------------------------------------------------------
// AdaptiveRtpScheduler
// ---------------------------------------------------------------------------

/// Laufender Scheduler – Handle auf den tokio-Task
///
/// Der Callback `sende_frame(frame_nr, aufrufzeit_ms)` laeuft im Task. Gibt
/// er `false` zurueck, endet der Scheduler und `bei_ende` erhaelt die
/// finale Statistik. Ein Abbruch ueber das Token ruft `bei_ende` nicht auf.
pub struct AdaptiveRtpScheduler {
    statistik: Arc<Mutex<SchedulerStatistik>>,
    frame_dauer: Arc<AtomicU32>,
    abbruch: CancellationToken,
    task: JoinHandle<()>,
}

impl AdaptiveRtpScheduler {
    /// Startet einen Scheduler
    pub fn starten<F, H>(
        config: SchedulerConfig,
        abbruch: CancellationToken,
        sende_frame: F,
        bei_ende: H,
    ) -> Self
    where
        F: FnMut(u64, u64) -> bool + Send + 'static,
        H: FnOnce(SchedulerStatistik) + Send + 'static,
    {
        let frame_dauer = Arc::new(AtomicU32::new(config.frame_dauer_ms));
        Self::mit_frame_dauer(config.ziel_tiefe_ms, frame_dauer, abbruch, sende_frame, bei_ende)
    }

    /// Startet einen Scheduler mit geteilter Frame-Dauer
    ///
    /// Aenderungen an `frame_dauer` gelten ab dem naechsten Frame.
    pub fn mit_frame_dauer<F, H>(
        ziel_tiefe_ms: u32,
        frame_dauer: Arc<AtomicU32>,
        abbruch: CancellationToken,
        mut sende_frame: F,
        bei_ende: H,
    ) -> Self
    where
        F: FnMut(u64, u64) -> bool + Send + 'static,
        H: FnOnce(SchedulerStatistik) + Send + 'static,
    {
        let statistik = Arc::new(Mutex::new(SchedulerStatistik::default()));
        let task_statistik = Arc::clone(&statistik);
        let task_frame_dauer = Arc::clone(&frame_dauer);
        let task_abbruch = abbruch.clone();

        let task = tokio::spawn(async move {
            let ziel = ziel_tiefe_ms as f64;
            let start = Instant::now();
            let mut basis = start;
            let mut gesendet_ms = 0.0f64;
            let mut frame_nr = 0u64;

            loop {
                let mut tiefe = gesendet_ms - ms_seit(basis);
                if tiefe < 0.0 {
                    task_statistik.lock().underruns += 1;
                    tracing::trace!(frame_nr, tiefe_ms = tiefe, "Scheduler-Underrun, Basis zurueckgesetzt");
                    basis = Instant::now();
                    gesendet_ms = 0.0;
                    tiefe = 0.0;
                }

                if tiefe < ziel {
                    task_statistik.lock().natuerliche_bursts += 1;
                } else {
                    let warten = Duration::from_secs_f64((tiefe - ziel) / 1000.0);
                    tokio::select! {
                        _ = task_abbruch.cancelled() => return,
                        _ = tokio::time::sleep(warten) => {}
                    }
                    tiefe = (gesendet_ms - ms_seit(basis)).max(0.0);
                }

                if task_abbruch.is_cancelled() {
                    return;
                }

                task_statistik.lock().tiefe_erfassen(tiefe);
                let aufrufzeit = start.elapsed().as_millis() as u64;
                let weiter = sende_frame(frame_nr, aufrufzeit);
                task_statistik.lock().pakete_geplant += 1;
                frame_nr += 1;
                gesendet_ms += task_frame_dauer.load(Ordering::Relaxed).max(1) as f64;

                if !weiter {
                    let abschluss = task_statistik.lock().clone();
                    tracing::debug!(
                        pakete = abschluss.pakete_geplant,
                        underruns = abschluss.underruns,
                        bursts = abschluss.natuerliche_bursts,
                        "Scheduler beendet"
                    );
                    bei_ende(abschluss);
                    return;
                }

                // Bursts duerfen den Worker nicht monopolisieren
                tokio::task::yield_now().await;
            }
        });

        Self {
            statistik,
            frame_dauer,
            abbruch,
            task,
        }
    }

    /// Aendert die Frame-Dauer ab dem naechsten Frame
    pub fn frame_dauer_setzen(&self, frame_dauer_ms: u32) {
        self.frame_dauer.store(frame_dauer_ms, Ordering::Relaxed);
    }

    pub fn frame_dauer_ms(&self) -> u32 {
        self.frame_dauer.load(Ordering::Relaxed)
    }

    /// Aktueller Statistik-Snapshot
    pub fn statistik(&self) -> SchedulerStatistik {
        self.statistik.lock().clone()
    }

    /// Bricht den Scheduler ab (ohne Abschluss-Callback)
    pub fn abbrechen(&self) {
        self.abbruch.cancel();
    }

    pub fn ist_beendet(&self) -> bool {
        self.task.is_finished()
    }

    /// Wartet bis der Task beendet ist
    pub async fn warten(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::warn!(fehler = %e, "Scheduler-Task mit Panic beendet");
            }
        }
    }
}

fn ms_seit(zeitpunkt: Instant) -> f64 {
    zeitpunkt.elapsed().as_secs_f64() * 1000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn fester_takt_ohne_vorlauf() {
        let (tx, rx) = oneshot::channel();
        let zeiten = Arc::new(Mutex::new(Vec::new()));
        let zeiten_cb = Arc::clone(&zeiten);

        let start = std::time::Instant::now();
        let _scheduler = AdaptiveRtpScheduler::starten(
            SchedulerConfig::takt(20),
            CancellationToken::new(),
            move |nr, _| {
                zeiten_cb.lock().push(start.elapsed());
                nr < 4
            },
            move |stat| {
                let _ = tx.send(stat);
            },
        );

        let stat = rx.await.expect("Abschluss-Callback");
        assert_eq!(stat.pakete_geplant, 5);

        let zeiten = zeiten.lock();
        assert_eq!(zeiten.len(), 5);
        // Erstes Paket sofort, danach 20-ms-Raster
        assert!(zeiten[0] < Duration::from_millis(15));
        assert!(zeiten[4] >= Duration::from_millis(79));
    }

    #[tokio::test]
    async fn geaenderte_frame_dauer_streckt_takt() {
        let (tx, rx) = oneshot::channel();
        let zeiten = Arc::new(Mutex::new(Vec::new()));
        let zeiten_cb = Arc::clone(&zeiten);

        let start = std::time::Instant::now();
        let scheduler = AdaptiveRtpScheduler::starten(
            SchedulerConfig::takt(20),
            CancellationToken::new(),
            move |nr, _| {
                zeiten_cb.lock().push(start.elapsed());
                nr < 4
            },
            move |stat| {
                let _ = tx.send(stat);
            },
        );
        // Der Task laeuft erst beim naechsten await an
        scheduler.frame_dauer_setzen(40);
        assert_eq!(scheduler.frame_dauer_ms(), 40);

        rx.await.expect("Abschluss-Callback");
        let zeiten = zeiten.lock();
        assert_eq!(zeiten.len(), 5);
        // 4 Abstaende zu 40 ms statt 20 ms
        assert!(zeiten[4] >= Duration::from_millis(159), "{:?}", zeiten[4]);
    }

    #[tokio::test]
    async fn vorlauf_erzeugt_bursts() {
        let (tx, rx) = oneshot::channel();
        let _scheduler = AdaptiveRtpScheduler::starten(
            SchedulerConfig {
                ziel_tiefe_ms: 60,
                frame_dauer_ms: 20,
            },
            CancellationToken::new(),
            |nr, _| nr < 9,
            move |stat| {
                let _ = tx.send(stat);
            },
        );

        let stat = rx.await.unwrap();
        assert_eq!(stat.pakete_geplant, 10);
        // Mindestens 0, 20, 40 ms Tiefe werden sofort gesendet
        assert!(stat.natuerliche_bursts >= 3);
        assert!(stat.max_tiefe_ms <= 80.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blockierender_callback_verschiebt_takt_nicht() {
        let (tx, rx) = oneshot::channel();
        let start = std::time::Instant::now();

        let _scheduler = AdaptiveRtpScheduler::starten(
            SchedulerConfig {
                ziel_tiefe_ms: 60,
                frame_dauer_ms: 20,
            },
            CancellationToken::new(),
            |nr, _| {
                if nr == 25 {
                    std::thread::sleep(Duration::from_millis(100));
                }
                nr < 49
            },
            move |stat| {
                let _ = tx.send(stat);
            },
        );

        let stat = rx.await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(stat.pakete_geplant, 50);
        assert!(stat.underruns >= 1, "Stau muss als Underrun zaehlen");
        assert!(stat.min_tiefe_ms >= 0.0);
        assert!(stat.max_tiefe_ms <= 100.0, "max Tiefe {}", stat.max_tiefe_ms);
        assert!(stat.mittlere_tiefe_ms >= stat.min_tiefe_ms);
        assert!(stat.mittlere_tiefe_ms <= stat.max_tiefe_ms);
    }

    #[tokio::test]
    async fn abbruch_ohne_abschluss_callback() {
        let aufrufe = Arc::new(AtomicU64::new(0));
        let aufrufe_cb = Arc::clone(&aufrufe);
        let abschluss = Arc::new(AtomicU64::new(0));
        let abschluss_cb = Arc::clone(&abschluss);

        let token = CancellationToken::new();
        let scheduler = AdaptiveRtpScheduler::starten(
            SchedulerConfig::takt(20),
            token.clone(),
            move |_, _| {
                aufrufe_cb.fetch_add(1, Ordering::SeqCst);
                true
            },
            move |_| {
                abschluss_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.abbrechen();
        scheduler.warten().await;

        let bisher = aufrufe.load(Ordering::SeqCst);
        assert!(bisher >= 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(aufrufe.load(Ordering::SeqCst), bisher);
        assert_eq!(abschluss.load(Ordering::SeqCst), 0);
        assert!(token.is_cancelled());
    }
}
