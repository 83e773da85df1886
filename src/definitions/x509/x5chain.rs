use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ciborium::Value;
use time::OffsetDateTime;
use x509_cert::der::{Decode, Encode};
use x509_cert::{certificate::Certificate, time::Time};

/// See: <https://www.iana.org/assignments/cose/cose.xhtml#header-parameters>
pub const X5CHAIN_COSE_HEADER_LABEL: i64 = 0x21;

/// X.509 certificate with the DER representation held in memory for ease of serialization.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CertificateWithDer {
    pub inner: Certificate,
    der: Vec<u8>,
}

impl CertificateWithDer {
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let inner = Certificate::from_der(bytes)
            .context("unable to parse certificate from DER encoding")?;
        Ok(Self {
            inner,
            der: bytes.to_vec(),
        })
    }

    pub fn from_cert(certificate: Certificate) -> Result<Self> {
        let der = certificate.to_der()?;
        Ok(Self {
            inner: certificate,
            der,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Validity window of the certificate, `(not_before, not_after)`.
    pub fn validity(&self) -> Result<(OffsetDateTime, OffsetDateTime)> {
        let validity = &self.inner.tbs_certificate.validity;
        Ok((
            to_offset_date_time(&validity.not_before)?,
            to_offset_date_time(&validity.not_after)?,
        ))
    }
}

fn to_offset_date_time(time: &Time) -> Result<OffsetDateTime> {
    let secs = i64::try_from(time.to_unix_duration().as_secs())?;
    OffsetDateTime::from_unix_timestamp(secs).context("certificate time out of range")
}

/// An ordered certificate chain, end-entity certificate first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X5Chain(Vec<CertificateWithDer>);

impl X5Chain {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Decode a JOSE-style `x5c` array: standard base64 of each DER certificate.
    pub fn from_x5c<S: AsRef<str>>(x5c: &[S]) -> Result<Self> {
        x5c.iter()
            .enumerate()
            .try_fold(Self::builder(), |builder, (i, cert)| {
                let der = STANDARD
                    .decode(cert.as_ref())
                    .with_context(|| format!("x5c entry {i} is not valid base64"))?;
                builder.with_der_certificate(&der)
            })?
            .build()
    }

    pub fn to_x5c(&self) -> Vec<String> {
        self.0.iter().map(|c| STANDARD.encode(&c.der)).collect()
    }

    pub fn from_der_certificates<B: AsRef<[u8]>>(certificates: &[B]) -> Result<Self> {
        certificates
            .iter()
            .try_fold(Self::builder(), |builder, der| {
                builder.with_der_certificate(der.as_ref())
            })?
            .build()
    }

    pub fn der_certificates(&self) -> Vec<Vec<u8>> {
        self.0.iter().map(|c| c.der.clone()).collect()
    }

    pub fn into_cbor(&self) -> Value {
        match self.0.as_slice() {
            [cert] => Value::Bytes(cert.der.clone()),
            certs => Value::Array(
                certs
                    .iter()
                    .map(|x509| Value::Bytes(x509.der.clone()))
                    .collect(),
            ),
        }
    }

    pub fn from_cbor(cbor: Value) -> Result<Self> {
        match cbor {
            Value::Bytes(bytes) => Self::builder().with_der_certificate(&bytes)?.build(),
            Value::Array(x509s) => x509s
                .iter()
                .try_fold(Self::builder(), |builder, x509| match x509 {
                    Value::Bytes(bytes) => builder.with_der_certificate(bytes),
                    _ => bail!("expected x509 certificate in the x5chain to be a cbor encoded bytestring, but received: {x509:?}"),
                })?
                .build(),
            _ => bail!("expected x5chain to be a cbor encoded bytestring or array, but received: {cbor:?}"),
        }
    }

    /// Retrieve the end-entity certificate.
    pub fn end_entity_certificate(&self) -> &CertificateWithDer {
        &self.0[0]
    }

    /// Retrieve the public key of the end-entity certificate.
    pub fn end_entity_public_key(&self) -> Result<p256::PublicKey> {
        let spki = &self
            .end_entity_certificate()
            .inner
            .tbs_certificate
            .subject_public_key_info;
        p256::PublicKey::from_sec1_bytes(spki.subject_public_key.raw_bytes())
            .map_err(|_| anyhow!("end-entity certificate does not carry a P-256 key"))
    }

    pub fn end_entity_subject(&self) -> String {
        self.end_entity_certificate()
            .inner
            .tbs_certificate
            .subject
            .to_string()
    }

    /// Validity window of the end-entity certificate.
    pub fn validity(&self) -> Result<(OffsetDateTime, OffsetDateTime)> {
        self.end_entity_certificate().validity()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the certificates in the chain.
    pub fn iter(&self) -> impl Iterator<Item = &CertificateWithDer> {
        self.0.iter()
    }
}

#[derive(Default, Debug, Clone)]
pub struct Builder {
    certs: Vec<CertificateWithDer>,
}

impl Builder {
    pub fn with_certificate(mut self, cert: Certificate) -> Result<Builder> {
        let x509 = CertificateWithDer::from_cert(cert)?;
        self.certs.push(x509);
        Ok(self)
    }

    pub fn with_der_certificate(mut self, data: &[u8]) -> Result<Builder> {
        let x509 = CertificateWithDer::from_der(data)?;
        self.certs.push(x509);
        Ok(self)
    }

    pub fn build(self) -> Result<X5Chain> {
        if self.certs.is_empty() {
            bail!("at least one certificate must be given to the builder");
        }
        Ok(X5Chain(self.certs))
    }
}
