use clap::{Parser, ValueEnum};
use mqtt_quic::{
	create_client, AnyConnector, ClientOptions, FilterBuf, QoS, QuicOptions, Subscriber,
	TlsOptions, WriterSink,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> mqtt_quic::Result<()> {
	setup_tracing()?;

	let arguments = Arguments::parse();
	let exit_timeout = Duration::from_millis(arguments.exit_timeout);
	let topics = arguments.topics()?;
	let options = arguments.client_options()?;
	let quic_options = arguments.quic_options()?;

	let sink = Arc::new(WriterSink::stdout());
	let options = options.with_events(sink.clone());
	let (client, handle) = create_client(options, AnyConnector::new(quic_options));

	let subscriber = Subscriber::new(topics);
	if let Err(error) = subscriber
		.run(&client, sink.as_ref(), shutdown_signal())
		.await
	{
		tracing::error!(%error, "subscriber stopped");
	}

	// Give the client task a bounded amount of time to send the Disconnect.
	let _ = client.disconnect();
	match tokio::time::timeout(exit_timeout, handle).await {
		Ok(Ok(Ok(()))) => {}
		Ok(Ok(Err(error))) => tracing::error!(%error, "client task failed"),
		Ok(Err(error)) => tracing::error!(%error, "client task panicked"),
		Err(_) => tracing::warn!(?exit_timeout, "disconnect timed out"),
	}

	println!("Disconnected");
	Ok(())
}

fn setup_tracing() -> Result<(), SetGlobalDefaultError> {
	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::ERROR.into())
		.with_env_var("MQTT_LOG")
		.try_from_env();

	let subscriber = tracing_subscriber::fmt()
		.with_file(true)
		.with_target(false)
		.with_env_filter(filter.unwrap_or_default())
		.finish();

	tracing::subscriber::set_global_default(subscriber)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		let mut terminate = match signal(SignalKind::terminate()) {
			Ok(terminate) => terminate,
			Err(error) => {
				tracing::warn!(%error, "failed to install SIGTERM handler");
				if let Err(error) = tokio::signal::ctrl_c().await {
					tracing::error!(%error, "failed to listen for SIGINT");
				}
				return;
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = terminate.recv() => {}
		}
	}

	#[cfg(not(unix))]
	if let Err(error) = tokio::signal::ctrl_c().await {
		tracing::error!(%error, "failed to listen for SIGINT");
	}
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Arguments {
	/// Broker URL. The scheme selects the transport: quic, mqtt or mqtts.
	#[arg(
		long,
		short = 'b',
		default_value = "quic://localhost:14567",
		env = "MQTT_BROKER"
	)]
	broker: url::Url,

	/// ID to use for this client.
	#[arg(long, short = 'i', env = "MQTT_ID")]
	id: Option<String>,

	/// Topic filters to subscribe to.
	#[arg(
		long = "topic",
		short = 't',
		default_value = "test/topic",
		value_delimiter = ',',
		env = "MQTT_TOPICS"
	)]
	topics: Vec<String>,

	#[arg(
		long,
		value_enum,
		default_value = "qos1",
		rename_all = "lower",
		env = "MQTT_QOS"
	)]
	qos: InputQoS,

	/// Keep-alive timeout, in seconds.
	#[arg(short = 'k', long, default_value = "60", env = "MQTT_KEEP_ALIVE")]
	keep_alive: u16,

	/// Disable clean session to enable persistent sessions.
	#[arg(short = 'c')]
	disable_clean_session: bool,

	#[arg(long, env = "MQTT_USERNAME")]
	username: Option<String>,

	#[arg(long, env = "MQTT_PASSWORD")]
	password: Option<String>,

	/// Exit on the first connection failure instead of reconnecting.
	#[arg(long)]
	no_reconnect: bool,

	/// ALPN protocol identifiers to offer.
	#[arg(long, default_value = "mqtt", value_delimiter = ',', env = "MQTT_ALPN")]
	alpn: Vec<String>,

	/// PEM file of CA certificates to trust instead of the WebPKI roots.
	#[arg(long, env = "MQTT_CA_FILE")]
	ca_file: Option<PathBuf>,

	/// Skip verification of the broker's certificate.
	#[arg(long, env = "MQTT_INSECURE")]
	insecure: bool,

	/// Name to verify the broker's certificate against, if not the host.
	#[arg(long, env = "MQTT_SERVER_NAME")]
	server_name: Option<String>,

	/// Transport handshake timeout, in milliseconds.
	#[arg(long, default_value = "10000")]
	handshake_timeout: u64,

	/// Stream open timeout, in milliseconds.
	#[arg(long, default_value = "5000")]
	stream_open_timeout: u64,

	/// How long to wait for the Disconnect to be sent, in milliseconds.
	#[arg(long, default_value = "250")]
	exit_timeout: u64,
}

impl Arguments {
	fn topics(&self) -> Result<Vec<(FilterBuf, QoS)>, mqtt_quic::FilterError> {
		self.topics
			.iter()
			.map(|topic| Ok((FilterBuf::new(topic.as_str())?, self.qos.into())))
			.collect()
	}

	fn client_options(&self) -> mqtt_quic::Result<ClientOptions> {
		let mut options = ClientOptions::try_from(&self.broker)?;

		let configuration = &mut options.configuration;
		configuration.keep_alive = self.keep_alive;
		configuration.clean_session = !self.disable_clean_session;
		configuration.reconnect = !self.no_reconnect;
		if let Some(username) = &self.username {
			configuration.username = Some(username.clone());
		}
		if let Some(password) = &self.password {
			configuration.password = Some(password.clone());
		}
		configuration.client_id = match &self.id {
			Some(id) => id.clone(),
			None if configuration.client_id.is_empty() => {
				build_client_id(configuration.clean_session)
			}
			None => configuration.client_id.clone(),
		};

		Ok(options)
	}

	fn quic_options(&self) -> mqtt_quic::Result<QuicOptions> {
		let mut tls = TlsOptions {
			alpn_protocols: self.alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
			..Default::default()
		};
		if let Some(path) = &self.ca_file {
			tls = tls.with_ca_file(path)?;
		}
		if self.insecure {
			tls = tls.insecure();
		}

		Ok(QuicOptions {
			tls,
			server_name: self.server_name.clone(),
			handshake_timeout: Duration::from_millis(self.handshake_timeout),
			stream_open_timeout: Duration::from_millis(self.stream_open_timeout),
			..Default::default()
		})
	}
}

fn build_client_id(clean_session: bool) -> String {
	if !clean_session {
		format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
	} else {
		format!(
			"{}/{}:{}",
			env!("CARGO_PKG_NAME"),
			env!("CARGO_PKG_VERSION"),
			std::process::id()
		)
	}
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputQoS {
	Qos0,
	Qos1,
	Qos2,
}

impl From<InputQoS> for QoS {
	fn from(value: InputQoS) -> Self {
		match value {
			InputQoS::Qos0 => QoS::AtMostOnce,
			InputQoS::Qos1 => QoS::AtLeastOnce,
			InputQoS::Qos2 => QoS::ExactlyOnce,
		}
	}
}
