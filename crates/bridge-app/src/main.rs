//! RTP audio bridge firmware for Pico 2 W
//!
//! Board bring-up and task wiring. All logic lives in the library crates;
//! this file owns the hardware singletons and spawns one task per worker.

#![no_std]
#![no_main]

use core::cell::RefCell;

use cyw43::aligned_bytes;
use cyw43_pio::{PioSpi, RM2_CLOCK_DIVIDER};
use defmt::info;
use embassy_executor::Spawner;
use embassy_net::{Stack, StackResources};
use embassy_rp::bind_interrupts;
use embassy_rp::clocks::RoscRng;
use embassy_rp::gpio::{Level, Output};
use embassy_rp::peripherals::{DMA_CH0, PIO0, PIO1, USB};
use embassy_rp::pio::{InterruptHandler as PioInterruptHandler, Pio};
use embassy_rp::usb::{Driver as UsbDriver, Endpoint, InterruptHandler as UsbInterruptHandler, Out};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Delay, Duration, Instant, Timer};
use embassy_usb::types::{SynchronizationType, UsageType};
use embassy_usb::{Builder, UsbDevice};
use rand_core::RngCore;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use audio_io::uac::{
    class, AudioControlDescriptor, AudioStreamingDescriptor, Uac2Config, MAX_USB_AUDIO_PACKET,
};
use audio_io::{SpdifSink, SpdifSource, UsbSink, UsbSource};
use audio_pipeline::{CaptureRing, JitterBuffer};
use config_store::ConfigStore;
use hal_pico2w::flash::FlashStore;
use hal_pico2w::led::LedPattern;
use hal_pico2w::spdif::{NoSpdifRx, PioSpdifTx};
use hal_pico2w::usb::{NoUsbHost, UacEndpointPort};
use hal_pico2w::{pins, wifi};
use rtp_wire::MasterClock;

use bridge_app::control::{ControlPlane, Counters, StateMirror};
use bridge_app::egress::{run_capture, run_egress, CaptureShared, EgressShared};
use bridge_app::ingress::{run_ingress, IngressShared};
use bridge_app::lifecycle::Event;
use bridge_app::pump::{run_pump, PumpShared};
use bridge_app::runtime::{run_lifecycle, RuntimeCtx};
use bridge_app::services::Services;
use bridge_app::{EventQueue, EventSender, JitterMutex, CAPTURE_SLOTS};

bind_interrupts!(struct Irqs {
    PIO0_IRQ_0 => PioInterruptHandler<PIO0>;
    PIO1_IRQ_0 => PioInterruptHandler<PIO1>;
    USBCTRL_IRQ => UsbInterruptHandler<USB>;
});

/// Station credentials come from the provisioning layer; during bring-up
/// they can be baked in at build time.
const WIFI_SSID: Option<&str> = option_env!("BRIDGE_WIFI_SSID");
const WIFI_PASSWORD: Option<&str> = option_env!("BRIDGE_WIFI_PASSWORD");

// Process-wide singletons, all const-initialized in static memory.
static EVENTS: EventQueue = EventQueue::new();
static JITTER: JitterMutex = BlockingMutex::new(RefCell::new(JitterBuffer::new()));
static CAPTURE_RING: CaptureRing<CAPTURE_SLOTS> = CaptureRing::new();
static MASTER_CLOCK: MasterClock = MasterClock::new();
static COUNTERS: Counters = Counters::new();
static STATE_MIRROR: StateMirror = StateMirror::new();
static SERVICES: Services = Services::new();
static INGRESS: IngressShared = IngressShared::new();
static PUMP_USB: PumpShared = PumpShared::new();
static PUMP_SPDIF: PumpShared = PumpShared::new();
static CAPTURE_USB: CaptureShared = CaptureShared::new();
static CAPTURE_SPDIF: CaptureShared = CaptureShared::new();
static EGRESS: EgressShared = EgressShared::new();

static STORE: StaticCell<Mutex<CriticalSectionRawMutex, ConfigStore<FlashStore<'static>>>> =
    StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();
static CYW43_STATE: StaticCell<cyw43::State> = StaticCell::new();

#[embassy_executor::task]
async fn cyw43_task(
    runner: cyw43::Runner<
        'static,
        cyw43::SpiBus<Output<'static>, PioSpi<'static, PIO0, 0, DMA_CH0>>,
    >,
) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn net_task(mut runner: embassy_net::Runner<'static, cyw43::NetDriver<'static>>) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn usb_task(mut usb: UsbDevice<'static, UsbDriver<'static, USB>>) -> ! {
    usb.run().await
}

#[embassy_executor::task]
async fn lifecycle_task(ctx: RuntimeCtx<FlashStore<'static>>) -> ! {
    run_lifecycle(ctx).await
}

#[embassy_executor::task]
async fn ingress_task(stack: Stack<'static>) -> ! {
    run_ingress(&INGRESS, stack, &JITTER, &MASTER_CLOCK, &COUNTERS, EVENTS.sender()).await
}

#[embassy_executor::task]
async fn pump_usb_task(mut sink: UsbSink<NoUsbHost, Delay>) -> ! {
    run_pump(
        &PUMP_USB,
        &JITTER,
        &MASTER_CLOCK,
        &COUNTERS,
        EVENTS.sender(),
        &mut sink,
    )
    .await
}

#[embassy_executor::task]
async fn pump_spdif_task(mut sink: SpdifSink<PioSpdifTx<'static, PIO1, 0>, Delay>) -> ! {
    run_pump(
        &PUMP_SPDIF,
        &JITTER,
        &MASTER_CLOCK,
        &COUNTERS,
        EVENTS.sender(),
        &mut sink,
    )
    .await
}

#[embassy_executor::task]
async fn capture_usb_task(
    mut source: UsbSource<UacEndpointPort<Endpoint<'static, USB, Out>>, Delay>,
) -> ! {
    run_capture(&CAPTURE_USB, &CAPTURE_RING, &mut source, EVENTS.sender()).await
}

#[embassy_executor::task]
async fn capture_spdif_task(mut source: SpdifSource<NoSpdifRx, Delay>) -> ! {
    run_capture(&CAPTURE_SPDIF, &CAPTURE_RING, &mut source, EVENTS.sender()).await
}

#[embassy_executor::task]
async fn egress_task(stack: Stack<'static>) -> ! {
    run_egress(&EGRESS, stack, &CAPTURE_RING, &COUNTERS, EVENTS.sender()).await
}

/// Owns the radio control handle: joins the network (or raises the
/// fallback AP), reports link state, then renders the status LED.
#[embassy_executor::task]
async fn wifi_task(
    mut control: cyw43::Control<'static>,
    stack: Stack<'static>,
    events: EventSender,
    sta: Option<wifi::StationCredentials>,
    ap_ssid: heapless::String<63>,
    ap_password: heapless::String<63>,
) -> ! {
    let joined = match sta {
        Some(creds) => wifi::join_station(&mut control, &creds).await.is_ok(),
        None => false,
    };

    if joined {
        events.send(Event::WifiConnected).await;
        stack.wait_config_up().await;
        info!("net: address acquired");
        events.send(Event::IpAcquired).await;
    } else {
        // No credentials or no network: the provisioning portal takes
        // over on the fallback AP.
        wifi::start_fallback_ap(&mut control, &ap_ssid, &ap_password).await;
    }

    // Render the status LED from the lifecycle state mirror.
    let started = Instant::now();
    loop {
        let pattern = match STATE_MIRROR.raw() {
            s if s == bridge_app::LifecycleState::Sleeping as u8 => LedPattern::Off,
            s if s == bridge_app::LifecycleState::Error as u8 => LedPattern::Error,
            s if s == bridge_app::LifecycleState::AwaitingModeConfig as u8 => {
                LedPattern::SlowBlink
            }
            s if s >= bridge_app::LifecycleState::ModeSenderUsb as u8
                && s <= bridge_app::LifecycleState::ModeReceiverSpdif as u8 =>
            {
                LedPattern::On
            }
            _ => LedPattern::FastBlink,
        };
        control
            .gpio_set(pins::LED, pattern.is_on(started.elapsed().as_millis()))
            .await;
        Timer::after(Duration::from_millis(50)).await;
    }
}

/// Periodic status line; doubles as the heartbeat while a web server is
/// not attached to the control plane.
#[embassy_executor::task]
async fn status_task(
    store: &'static Mutex<CriticalSectionRawMutex, ConfigStore<FlashStore<'static>>>,
) -> ! {
    let control = ControlPlane::new(store, EVENTS.sender(), &COUNTERS, &JITTER, &STATE_MIRROR);
    loop {
        Timer::after(Duration::from_secs(30)).await;
        let status = control.status();
        defmt::debug!(
            "status: rx {} lost {} ({} %) buf {}/{} underruns {} ota {}",
            status.packets_received,
            status.packets_lost,
            status.loss_rate_percent,
            status.buffer_level,
            status.buffer_target,
            status.underruns,
            SERVICES.ota_state(),
        );
    }
}

/// Append the class-specific interface elements of a built descriptor
/// blob. Plain interface and endpoint descriptors are skipped: embassy-usb
/// emits those itself when the alternate and endpoint are allocated.
fn push_class_descriptors<'d, D: embassy_usb::driver::Driver<'d>>(
    alt: &mut embassy_usb::builder::InterfaceAltBuilder<'_, 'd, D>,
    blob: &[u8],
) {
    let mut pos = 0;
    while pos + 2 <= blob.len() {
        let len = blob[pos] as usize;
        if len < 2 || pos + len > blob.len() {
            break;
        }
        let descriptor_type = blob[pos + 1];
        if !matches!(descriptor_type, 0x04 | 0x05 | 0x25) {
            alt.descriptor(descriptor_type, &blob[pos + 2..pos + len]);
        }
        pos += len;
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("=== RTP audio bridge ===");
    let p = embassy_rp::init(Default::default());

    // Persistent configuration first; everything else is parameterized by
    // it. An unusable flash ends the boot here.
    let store = match ConfigStore::load(FlashStore::new(p.FLASH)) {
        Ok(store) => store,
        Err(_) => {
            defmt::error!("config: backing store unusable even after wipe");
            loop {
                Timer::after(Duration::from_secs(5)).await;
            }
        }
    };
    let boot_config = store.config().clone();
    let store = STORE.init(Mutex::new(store));
    info!(
        "config: mode {}, port {}, rate {} Hz",
        boot_config.device_mode, boot_config.port, boot_config.sample_rate
    );

    // CYW43439 radio over PIO SPI.
    let fw = aligned_bytes!("../../../firmware/43439A0.bin");
    let clm = aligned_bytes!("../../../firmware/43439A0_clm.bin");

    let pwr = Output::new(p.PIN_23, Level::Low);
    let cs = Output::new(p.PIN_25, Level::High);
    let mut pio0 = Pio::new(p.PIO0, Irqs);
    let spi = PioSpi::new(
        &mut pio0.common,
        pio0.sm0,
        RM2_CLOCK_DIVIDER,
        pio0.irq0,
        cs,
        p.PIN_24,
        p.PIN_29,
        p.DMA_CH0,
    );

    let state = CYW43_STATE.init(cyw43::State::new());
    let (net_device, mut control, runner) = cyw43::new(state, pwr, spi, fw, clm).await;
    spawner.must_spawn(cyw43_task(runner));
    control.init(clm).await;
    control
        .set_power_management(cyw43::PowerManagementMode::Performance)
        .await;
    let mac = control.address().await;
    info!("wifi: radio up");

    // Network stack with DHCP.
    let mut rng = RoscRng;
    let (stack, net_runner) = embassy_net::new(
        net_device,
        embassy_net::Config::dhcpv4(Default::default()),
        NET_RESOURCES.init(StackResources::new()),
        rng.next_u64(),
    );
    spawner.must_spawn(net_task(net_runner));

    // UAC2 device function: the bridge shows up as a USB speaker and the
    // host's playback becomes our SenderUsb capture.
    let usb_driver = UsbDriver::new(p.USB, Irqs);
    let uac = Uac2Config::default();
    let mut usb_config = embassy_usb::Config::new(uac.vid, uac.pid);
    usb_config.manufacturer = Some("rtp-bridge");
    usb_config.product = Some(uac.name);
    usb_config.max_power = 100;

    static CONFIG_DESC: StaticCell<[u8; 512]> = StaticCell::new();
    static BOS_DESC: StaticCell<[u8; 32]> = StaticCell::new();
    static MSOS_DESC: StaticCell<[u8; 0]> = StaticCell::new();
    static CONTROL_BUF: StaticCell<[u8; 128]> = StaticCell::new();
    let mut builder = Builder::new(
        usb_driver,
        usb_config,
        CONFIG_DESC.init([0; 512]),
        BOS_DESC.init([0; 32]),
        MSOS_DESC.init([]),
        CONTROL_BUF.init([0; 128]),
    );

    let mut descriptor_buf = [0u8; 128];
    let mut function = builder.function(class::AUDIO, class::AUDIO_CONTROL, class::UAC2_PROTOCOL);
    let mut interface = function.interface();

    // Audio Control alternate with its class-specific chain.
    let mut alt_control =
        interface.alt_setting(class::AUDIO, class::AUDIO_CONTROL, class::UAC2_PROTOCOL, None);
    let len = AudioControlDescriptor::new(uac.clone()).build(&mut descriptor_buf);
    push_class_descriptors(&mut alt_control, &descriptor_buf[..len]);
    drop(alt_control);
    drop(interface);

    // Streaming interface: alt 0 zero-bandwidth, alt 1 with the iso OUT
    // endpoint the capture source reads.
    let mut streaming = function.interface();
    let streaming_desc = AudioStreamingDescriptor::new(uac.clone());
    let _ =
        streaming.alt_setting(class::AUDIO, class::AUDIO_STREAMING, class::UAC2_PROTOCOL, None);
    let mut alt1 =
        streaming.alt_setting(class::AUDIO, class::AUDIO_STREAMING, class::UAC2_PROTOCOL, None);
    let len = streaming_desc.build_alt1(&mut descriptor_buf, 1, 0x01);
    push_class_descriptors(&mut alt1, &descriptor_buf[..len]);
    let iso_out = alt1.endpoint_isochronous_out(
        MAX_USB_AUDIO_PACKET as u16,
        1,
        SynchronizationType::Asynchronous,
        UsageType::DataEndpoint,
        &[],
    );
    drop(alt1);
    drop(streaming);
    drop(function);
    let usb = builder.build();
    spawner.must_spawn(usb_task(usb));

    // S/PDIF transmitter on PIO1.
    let pio1 = Pio::new(p.PIO1, Irqs);
    let spdif_tx = PioSpdifTx::new(
        pio1.common,
        pio1.sm0,
        p.PIN_15.into(),
        hal_pico2w::clocks::ClockConfig::default().sys_clk,
    );

    // Audio adapters and their workers.
    spawner.must_spawn(pump_usb_task(UsbSink::new(NoUsbHost, Delay)));
    spawner.must_spawn(pump_spdif_task(SpdifSink::new(
        spdif_tx,
        Delay,
        pins::SPDIF_TX,
    )));
    spawner.must_spawn(capture_usb_task(UsbSource::new(
        UacEndpointPort::new(iso_out),
        Delay,
    )));
    spawner.must_spawn(capture_spdif_task(SpdifSource::new(
        NoSpdifRx,
        Delay,
        pins::SPDIF_TX,
    )));
    spawner.must_spawn(ingress_task(stack));
    spawner.must_spawn(egress_task(stack));

    // Radio ownership moves to the wifi/LED task.
    let sta = WIFI_SSID.map(|ssid| wifi::StationCredentials {
        ssid,
        password: WIFI_PASSWORD.unwrap_or(""),
    });
    spawner.must_spawn(wifi_task(
        control,
        stack,
        EVENTS.sender(),
        sta,
        boot_config.ap_ssid.clone(),
        boot_config.ap_password.clone(),
    ));

    // The lifecycle worker takes over from here.
    spawner.must_spawn(lifecycle_task(RuntimeCtx {
        events: &EVENTS,
        store,
        jitter: &JITTER,
        clock: &MASTER_CLOCK,
        counters: &COUNTERS,
        services: &SERVICES,
        state_mirror: &STATE_MIRROR,
        ingress: &INGRESS,
        pump_usb: &PUMP_USB,
        pump_spdif: &PUMP_SPDIF,
        capture_usb: &CAPTURE_USB,
        capture_spdif: &CAPTURE_SPDIF,
        egress: &EGRESS,
        stack,
        mac,
    }));

    spawner.must_spawn(status_task(store));
    info!("boot: all tasks spawned");
}
