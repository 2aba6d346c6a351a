use mongodb::bson::{Document, doc};
use mongodb::options::{
    Acknowledgment, AuthMechanism, ClientOptions, Credential, ReadConcern,
    ReadPreference as DriverReadPreference, SelectionCriteria, ServerAddress, Tls, TlsOptions,
    WriteConcern,
};
use mongodb::sync::{Client, Database};

use super::{NodeSession, SessionError};
use crate::config::target::{ConnectionTarget, ReadConcernLevel, ReadPreference, WriteAck};

/// Direct session to one replica-set member, built from an immutable
/// `ConnectionTarget`. `direct_connection` is set so the lock lands on the
/// addressed node and not on whatever the topology would route to.
pub struct MongoSession {
    host: String,
    database: String,
    client: Option<Client>,
}

impl MongoSession {
    pub fn connect(target: &ConnectionTarget, host: &str, port: u16) -> Result<Self, SessionError> {
        let options = build_options(target, host, port)?;
        let client = Client::with_options(options)?;
        let session = Self {
            host: host.to_string(),
            database: target.database.clone(),
            client: Some(client),
        };
        // The sync client connects lazily; ping so unreachable hosts and bad
        // credentials fail here instead of at lock time.
        session.db()?.run_command(doc! { "ping": 1 }, None)?;
        Ok(session)
    }

    fn db(&self) -> Result<Database, SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::Closed)?;
        Ok(client.database(&self.database))
    }
}

impl NodeSession for MongoSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn flush_and_lock(&mut self) -> Result<(), SessionError> {
        self.db()?.run_command(doc! { "fsync": 1, "lock": true }, None)?;
        Ok(())
    }

    fn flush_unlock(&mut self) -> Result<(), SessionError> {
        self.db()?.run_command(doc! { "fsyncUnlock": 1 }, None)?;
        Ok(())
    }

    fn in_flight_lock_ops(&mut self) -> Result<usize, SessionError> {
        let reply = self.db()?.run_command(doc! { "currentOp": 1 }, None)?;
        pending_lock_ops(&reply)
    }

    fn close(&mut self) {
        // Dropping the client tears down the pool; a second close is a no-op.
        self.client = None;
    }
}

/// In-progress operations still holding the flush lock. A reply without an
/// `inprog` list is malformed and must not pass for "no pending operations".
fn pending_lock_ops(reply: &Document) -> Result<usize, SessionError> {
    let inprog = reply
        .get_array("inprog")
        .map_err(|_| SessionError::Command("currentOp reply has no inprog list".to_string()))?;
    let pending = inprog
        .iter()
        .filter_map(|op| op.as_document())
        .filter(|op| {
            op.get_document("command")
                .map(|cmd| cmd.contains_key("fsync") || cmd.contains_key("fsyncLock"))
                .unwrap_or(false)
        })
        .count();
    Ok(pending)
}

fn build_options(
    target: &ConnectionTarget,
    host: &str,
    port: u16,
) -> Result<ClientOptions, SessionError> {
    let mut options = ClientOptions::builder()
        .hosts(vec![ServerAddress::Tcp {
            host: host.to_string(),
            port: Some(port),
        }])
        .direct_connection(true)
        .build();

    options.app_name = Some("mongosnap".to_string());
    options.max_pool_size = Some(target.max_pool_size);
    options.min_pool_size = Some(target.min_pool_size);
    // `target.wait_queue_timeout` is parsed for URI compatibility but not
    // applied: the 2.x Rust driver has no wait-queue timeout option.
    options.connect_timeout = Some(target.connect_timeout);
    options.server_selection_timeout = Some(target.server_selection_timeout);
    options.heartbeat_freq = Some(target.heartbeat_freq);
    options.repl_set_name = target.replica_set.clone();
    options.default_database = Some(target.database.clone());

    options.read_concern = Some(match target.read_concern {
        ReadConcernLevel::Local => ReadConcern::local(),
        ReadConcernLevel::Majority => ReadConcern::majority(),
        ReadConcernLevel::Available => ReadConcern::available(),
        ReadConcernLevel::Linearizable => ReadConcern::linearizable(),
    });
    options.write_concern = Some(
        WriteConcern::builder()
            .w(match &target.write_concern {
                WriteAck::Majority => Acknowledgment::Majority,
                WriteAck::Nodes(n) => Acknowledgment::Nodes(*n),
            })
            .build(),
    );
    options.selection_criteria = Some(SelectionCriteria::ReadPreference(
        match target.read_preference {
            ReadPreference::Primary => DriverReadPreference::Primary,
            ReadPreference::Secondary => DriverReadPreference::Secondary {
                options: Default::default(),
            },
            ReadPreference::SecondaryPreferred => DriverReadPreference::SecondaryPreferred {
                options: Default::default(),
            },
            ReadPreference::Nearest => DriverReadPreference::Nearest {
                options: Default::default(),
            },
        },
    ));

    let mut credential = Credential::builder()
        .username(target.username.clone())
        .password(target.password.clone())
        .source(target.auth_source.clone())
        .build();
    if let Some(name) = &target.auth_mechanism {
        // DEFAULT means let the driver negotiate during the handshake.
        if name != "DEFAULT" {
            credential.mechanism = Some(mechanism_for(name)?);
        }
    }
    options.credential = Some(credential);

    if let Some(tls) = &target.tls {
        let mut tls_options = TlsOptions::builder().build();
        tls_options.ca_file_path = tls.ca_file.clone();
        tls_options.cert_key_file_path = tls.cert_key_file.clone();
        options.tls = Some(Tls::Enabled(tls_options));
    }

    Ok(options)
}

fn mechanism_for(name: &str) -> Result<AuthMechanism, SessionError> {
    match name {
        "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
        "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
        "MONGODB-X509" => Ok(AuthMechanism::MongoDbX509),
        "PLAIN" => Ok(AuthMechanism::Plain),
        other => Err(SessionError::UnsupportedMechanism(other.to_string())),
    }
}
